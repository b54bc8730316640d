//! Error code lookup tables
//!
//! Version 1 responses carry a bare `rc` from a fixed table shared by all
//! groups. Version 2 responses carry a group-specific `rc` whose values 0 and
//! 1 keep their generic meaning and whose remaining values index the group's
//! own table, offset by [`GROUP_ERROR_OFFSET`].

use std::collections::HashMap;

use crate::error::Error;

/// First group-specific rc value
pub const GROUP_ERROR_OFFSET: i32 = 2;

/// Name and description of one error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Symbolic name, e.g. `EINVAL`
    pub name: &'static str,
    /// Human readable description
    pub description: &'static str,
}

impl ErrorEntry {
    /// Create a new entry
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }
}

/// Generic rc table used by version 1 responses
pub const RC_ERRORS: &[ErrorEntry] = &[
    ErrorEntry::new("EOK", "No error"),
    ErrorEntry::new("EUNKNOWN", "Unknown error"),
    ErrorEntry::new("ENOMEM", "Insufficient memory"),
    ErrorEntry::new("EINVAL", "Error in input value"),
    ErrorEntry::new("ETIMEOUT", "Operation timed out"),
    ErrorEntry::new("ENOENT", "No such file/entry"),
    ErrorEntry::new("EBADSTATE", "Current state disallows command"),
    ErrorEntry::new("EMSGSIZE", "Response too large"),
    ErrorEntry::new("ENOTSUP", "Command not supported"),
    ErrorEntry::new("ECORRUPT", "Corrupt"),
    ErrorEntry::new("EBUSY", "Command blocked by processing of other command"),
    ErrorEntry::new(
        "EACCESSDENIED",
        "Access to specific function, command or resource denied",
    ),
    ErrorEntry::new(
        "UNSUPPORTED_TOO_OLD",
        "Requested SMP MCUmgr protocol version is not supported (too old)",
    ),
    ErrorEntry::new(
        "UNSUPPORTED_TOO_NEW",
        "Requested SMP MCUmgr protocol version is not supported (too new)",
    ),
];

/// Text used when an error code has no table entry
pub const UNKNOWN: &str = "unknown";

/// Registry of per-group error tables
///
/// Each group registers its table once, normally when the group is created.
/// Later registrations for the same group are ignored.
#[derive(Debug, Default, Clone)]
pub struct ErrorRegistry {
    groups: HashMap<u16, &'static [ErrorEntry]>,
}

impl ErrorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the error table of a group
    ///
    /// Returns `false` if the group already has a table; the existing table
    /// is kept.
    pub fn register(&mut self, group: u16, table: &'static [ErrorEntry]) -> bool {
        if self.groups.contains_key(&group) {
            log::trace!("registry: group {} already registered", group);
            return false;
        }
        self.groups.insert(group, table);
        true
    }

    /// Whether a table is registered for the group
    pub fn is_registered(&self, group: u16) -> bool {
        self.groups.contains_key(&group)
    }

    /// Look up a version 1 rc
    pub fn lookup_rc(&self, rc: i32) -> Option<&'static ErrorEntry> {
        usize::try_from(rc).ok().and_then(|i| RC_ERRORS.get(i))
    }

    /// Look up a version 2 group rc
    pub fn lookup_group(&self, group: u16, rc: i32) -> Option<&'static ErrorEntry> {
        if rc < GROUP_ERROR_OFFSET {
            return self.lookup_rc(rc);
        }

        let table: &'static [ErrorEntry] = self.groups.get(&group)?;
        usize::try_from(rc - GROUP_ERROR_OFFSET)
            .ok()
            .and_then(|i| table.get(i))
    }

    /// Look up the entry for a protocol-level error
    ///
    /// Returns `None` for transport and image errors, which have no rc.
    pub fn lookup(&self, error: &Error) -> Option<&'static ErrorEntry> {
        match *error {
            Error::Rc { rc } => self.lookup_rc(rc),
            Error::Group { group, rc } => self.lookup_group(group, rc),
            Error::Transport(_) | Error::Image(_) => None,
        }
    }

    /// Describe an error in one line, resolving rc values through the tables
    pub fn describe(&self, error: &Error) -> String {
        match error {
            Error::Rc { .. } | Error::Group { .. } => {
                let (name, description) = self
                    .lookup(error)
                    .map_or((UNKNOWN, UNKNOWN), |e| (e.name, e.description));
                format!("{} ({}: {})", error, name, description)
            }
            _ => error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    const TEST_GROUP: u16 = 1;
    const TEST_ERRORS: &[ErrorEntry] = &[
        ErrorEntry::new("FIRST", "First group error"),
        ErrorEntry::new("SECOND", "Second group error"),
    ];

    #[test]
    fn test_rc_table() {
        let registry = ErrorRegistry::new();
        assert_eq!(RC_ERRORS.len(), 14);
        assert_eq!(registry.lookup_rc(0).unwrap().name, "EOK");
        assert_eq!(registry.lookup_rc(3).unwrap().name, "EINVAL");
        assert_eq!(registry.lookup_rc(13).unwrap().name, "UNSUPPORTED_TOO_NEW");
        assert!(registry.lookup_rc(14).is_none());
        assert!(registry.lookup_rc(-1).is_none());
    }

    #[test]
    fn test_group_offset() {
        let mut registry = ErrorRegistry::new();
        assert!(registry.register(TEST_GROUP, TEST_ERRORS));

        assert_eq!(registry.lookup_group(TEST_GROUP, 0).unwrap().name, "EOK");
        assert_eq!(registry.lookup_group(TEST_GROUP, 1).unwrap().name, "EUNKNOWN");
        assert_eq!(registry.lookup_group(TEST_GROUP, 2).unwrap().name, "FIRST");
        assert_eq!(registry.lookup_group(TEST_GROUP, 3).unwrap().name, "SECOND");
        assert!(registry.lookup_group(TEST_GROUP, 4).is_none());
        assert!(registry.lookup_group(99, 2).is_none());
    }

    #[test]
    fn test_register_once() {
        const OTHER: &[ErrorEntry] = &[ErrorEntry::new("OTHER", "Other")];

        let mut registry = ErrorRegistry::new();
        assert!(registry.register(TEST_GROUP, TEST_ERRORS));
        assert!(!registry.register(TEST_GROUP, OTHER));
        assert_eq!(registry.lookup_group(TEST_GROUP, 2).unwrap().name, "FIRST");
        assert!(registry.is_registered(TEST_GROUP));
    }

    #[test]
    fn test_describe() {
        let mut registry = ErrorRegistry::new();
        registry.register(TEST_GROUP, TEST_ERRORS);

        assert_eq!(
            registry.describe(&Error::Group { group: TEST_GROUP, rc: 3 }),
            "SMP version 2 error, group: 1, rc: 3 (SECOND: Second group error)"
        );
        assert_eq!(
            registry.describe(&Error::Rc { rc: 8 }),
            "SMP version 1 error, rc: 8 (ENOTSUP: Command not supported)"
        );
        assert_eq!(
            registry.describe(&Error::Group { group: 42, rc: 7 }),
            "SMP version 2 error, group: 42, rc: 7 (unknown: unknown)"
        );
        assert_eq!(
            registry.describe(&Error::Transport(TransportError::Timeout)),
            "Timeout waiting for response"
        );
    }
}
