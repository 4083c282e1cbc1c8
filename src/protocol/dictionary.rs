//! Dictionary collaborator used for command short-name resolution.
//!
//! The multiplexer only needs one query from a dictionary: the short name of
//! a command for an `(application id, command code)` pair. Schema parsing and
//! AVP rules live outside this crate.

use std::collections::HashMap;

use crate::protocol::error::{ProtocolError, ProtocolResult};

/// Base protocol application id.
pub const BASE_APPLICATION_ID: u32 = 0;

/// Diameter Credit-Control application id.
pub const CREDIT_CONTROL_APPLICATION_ID: u32 = 4;

/// Resolves commands to their short names.
pub trait Dictionary: Send + Sync + std::fmt::Debug {
    /// Return the short name (e.g. `"CE"`, `"CC"`) of a command.
    ///
    /// An error means the dictionary has no entry for this command.
    fn find_command(&self, application_id: u32, command_code: u32) -> ProtocolResult<String>;
}

/// Built-in dictionary with the well-known base and credit-control commands.
///
/// Lookups in an application that lacks the code fall back to the base
/// application.
#[derive(Debug, Clone)]
pub struct BaseDictionary {
    commands: HashMap<(u32, u32), String>,
}

impl BaseDictionary {
    /// Create the default dictionary.
    pub fn new() -> Self {
        let mut dict = Self::empty();
        for (code, short) in [
            (257, "CE"),
            (258, "RA"),
            (271, "AC"),
            (274, "AS"),
            (275, "ST"),
            (280, "DW"),
            (282, "DP"),
        ] {
            dict.insert(BASE_APPLICATION_ID, code, short);
        }
        dict.insert(CREDIT_CONTROL_APPLICATION_ID, 272, "CC");
        dict
    }

    /// Create a dictionary with no commands.
    pub fn empty() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Add or replace a command entry.
    pub fn insert(&mut self, application_id: u32, command_code: u32, short_name: impl Into<String>) {
        self.commands.insert((application_id, command_code), short_name.into());
    }
}

impl Default for BaseDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary for BaseDictionary {
    fn find_command(&self, application_id: u32, command_code: u32) -> ProtocolResult<String> {
        self.commands
            .get(&(application_id, command_code))
            .or_else(|| self.commands.get(&(BASE_APPLICATION_ID, command_code)))
            .cloned()
            .ok_or(ProtocolError::CommandNotFound {
                application_id,
                command_code,
            })
    }
}
