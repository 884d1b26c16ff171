pub mod housekeeping;
pub mod message_channel;
pub mod sync;
pub mod team_service;
