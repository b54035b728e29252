pub mod exec;
pub mod health;
pub mod status;
