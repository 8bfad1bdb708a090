pub mod alert;
pub mod envelope;
pub mod message;
pub mod rider;
