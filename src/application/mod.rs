// Application layer - session orchestration, ports and control flow
pub mod command_dispatcher;
pub mod events;
pub mod heartbeat;
pub mod operation_journal;
pub mod permission;
pub mod reconnect_policy;
pub mod session_registry;
pub mod site_gateway;
pub mod site_session;
pub mod state_merger;
pub mod transport;

#[cfg(test)]
pub mod test_support;
