use std::ops::Add;

/// An architecture-specific register id. Backends are free to assign any
/// numbering; `dbgcore` only ever treats these as opaque keys except where
/// the ABI streams need to walk a contiguous run (`r0..r3`, `x0..x7`, ...),
/// which is why `Add<u32>` is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl Add<u32> for Reg {
    type Output = Reg;

    fn add(self, rhs: u32) -> Reg {
        Reg(self.0 + rhs)
    }
}

impl From<u32> for Reg {
    fn from(id: u32) -> Reg {
        Reg(id)
    }
}
