pub mod guard;
pub mod model;
pub mod provider;
pub mod services;
pub mod task;
