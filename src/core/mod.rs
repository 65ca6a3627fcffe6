mod checkpoint;
mod confusion;
mod parser;
mod recoder;
mod runloops;
mod scheduler;
mod tracker;
pub use parser::Learner;
pub use recoder::build_log_config;
pub use runloops::run;
