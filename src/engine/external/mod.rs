pub mod gulp;
