mod helpers;
mod metadata_tests;
mod truncate_tests;
