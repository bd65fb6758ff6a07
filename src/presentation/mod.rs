// Presentation layer - local HTTP surface standing in for site screens
pub mod app_state;
pub mod event_stream;
pub mod handlers;
