pub mod dbcolab;
