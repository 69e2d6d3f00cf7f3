pub mod auth;
pub mod register;
pub mod sales;
