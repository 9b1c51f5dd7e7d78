pub mod journal_tests;
