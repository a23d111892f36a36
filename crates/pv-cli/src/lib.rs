//! preview: provision disposable environments for compose projects
//!
//! `up` finds or creates a machine, copies the project to it, starts it with
//! the tunnel agent alongside and prints the URLs the agent published.

pub mod commands;
pub mod compose;
pub mod driver;
pub mod keys;
pub mod output;
pub mod provision;
pub mod tunnels;

#[cfg(test)]
mod testing;
