pub mod helpers;
mod tests_corruption;
mod tests_get;
mod tests_scan;
