mod helpers;
mod iterator_tests;
mod read_tests;
mod recovery_tests;
mod vlog_tests;
