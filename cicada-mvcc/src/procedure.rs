/// Kind of a workload step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// One step of a transaction as a workload generator hands it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Procedure {
    pub kind: OpKind,
    pub key: u64,
    /// Read the key before overwriting it.
    pub rmw: bool,
}

impl Procedure {
    pub fn read(key: u64) -> Self {
        Self {
            kind: OpKind::Read,
            key,
            rmw: false,
        }
    }

    pub fn write(key: u64) -> Self {
        Self {
            kind: OpKind::Write,
            key,
            rmw: false,
        }
    }

    pub fn read_modify_write(key: u64) -> Self {
        Self {
            kind: OpKind::Write,
            key,
            rmw: true,
        }
    }

    /// True when every step only reads.
    pub fn is_read_only(procedures: &[Procedure]) -> bool {
        procedures.iter().all(|p| p.kind == OpKind::Read)
    }
}
