mod builder_tests;
mod helpers;
mod merge_tests;
