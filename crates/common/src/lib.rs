pub mod epoch;
pub mod pathspec;
