pub mod model;
pub mod restore;
pub mod scheduler;
pub mod store;
