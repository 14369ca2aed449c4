mod auth_flow;
mod message_flow;
