// Domain layer - site model, commands and gateway protocol
pub mod command;
pub mod connection;
pub mod protocol;
pub mod site;
