pub mod conversations;
pub mod maintenance;
pub mod messages;
