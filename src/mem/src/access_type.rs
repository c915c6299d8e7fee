#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessType {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl std::fmt::Debug for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { "r" } else { "-" },
            if self.write { "w" } else { "-" },
            if self.execute { "x" } else { "-" }
        )
    }
}

impl AccessType {
    pub const fn read() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
        }
    }

    pub const fn write() -> Self {
        Self {
            read: false,
            write: true,
            execute: false,
        }
    }

    pub const fn execute() -> Self {
        Self {
            read: false,
            write: false,
            execute: true,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    pub const fn any_access() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
        }
    }

    pub fn is_superset_of(&self, other: AccessType) -> bool {
        (self.read || !other.read) && (self.write || !other.write) && (self.execute || !other.execute)
    }

    // is_widened_by reports whether switching from self to other grants
    // write access that self did not have.
    pub fn is_widened_by(&self, other: AccessType) -> bool {
        !self.write && other.write
    }

    // without_write is the protection a page shared copy-on-write is mapped
    // with.
    pub fn without_write(&self) -> AccessType {
        AccessType {
            write: false,
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superset_and_widening() {
        assert!(AccessType::read_write().is_superset_of(AccessType::read()));
        assert!(!AccessType::read().is_superset_of(AccessType::write()));
        assert!(!AccessType::read_write().is_superset_of(AccessType::execute()));
        assert!(AccessType::read().is_widened_by(AccessType::read_write()));
        assert!(!AccessType::read_write().is_widened_by(AccessType::read()));
    }

    #[test]
    fn write_is_dropped_for_cow() {
        assert_eq!(AccessType::any_access().without_write(), AccessType {
            read: true,
            write: false,
            execute: true,
        });
        assert_eq!(format!("{:?}", AccessType::read_write().without_write()), "r--");
    }
}
