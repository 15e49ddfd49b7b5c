pub mod menu;
pub mod notifications;
