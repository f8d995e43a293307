pub mod session;
pub mod server_types;

// fan out
pub mod delivery;
pub mod server_channel;

// per connection
pub mod client_handler;
pub mod listener;
