// (C) 2020 Brandon Lewis
//
// The capability model.
//
// A capability set is a claim, not a policy: providers (builtins,
// iterators, host extensions) declare the classes of side effect they
// promise to respect, and consumers (the thread) declare what they
// require. The thread mediates; see thread.rs for enforcement.
//
// The wrapper holds a raw byte rather than a checked BitFlags so that
// an undefined bit pattern remains representable: a corrupt
// declaration must surface as a typed error at check time, not as a
// panic at construction time.

use std::fmt;

use enumflags2::BitFlags;

use crate::error::{Error, Result};

// The four defined capability bits, in canonical rendering order.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Safety {
    CpuSafe  = 0b0001, // runs in bounded steps
    MemSafe  = 0b0010, // accounts for its allocations
    TimeSafe = 0b0100, // does not observe wall-clock time
    IoSafe   = 0b1000, // does not interact with the host OS
}

pub type SafetySet = BitFlags<Safety>;

impl Safety {
    // The lowercase wire names used by from_names/names.
    pub fn name(self) -> &'static str {
        match self {
            Safety::CpuSafe => "cpusafe",
            Safety::MemSafe => "memsafe",
            Safety::TimeSafe => "timesafe",
            Safety::IoSafe => "iosafe",
        }
    }

    fn render(self) -> &'static str {
        match self {
            Safety::CpuSafe => "CpuSafe",
            Safety::MemSafe => "MemSafe",
            Safety::TimeSafe => "TimeSafe",
            Safety::IoSafe => "IoSafe",
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SafetyFlags(u8);

impl SafetyFlags {
    pub const NOT_SAFE: SafetyFlags = SafetyFlags(0);
    pub const SAFE: SafetyFlags = SafetyFlags(0b1111);

    pub fn new(set: SafetySet) -> SafetyFlags {
        SafetyFlags(set.bits())
    }

    pub fn from_bits(bits: u8) -> SafetyFlags {
        SafetyFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_valid(self) -> bool {
        self.0 & !SafetySet::all().bits() == 0
    }

    pub fn validate(self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::InvalidFlags)
        }
    }

    // The defined-bit view. Errors on undefined bits.
    pub fn flags(self) -> Result<SafetySet> {
        self.validate()?;
        Ok(BitFlags::from_bits_truncate(self.0))
    }

    pub fn union(self, other: SafetyFlags) -> SafetyFlags {
        SafetyFlags(self.0 | other.0)
    }

    pub fn contains(self, flag: Safety) -> bool {
        self.0 & flag as u8 != 0
    }

    // True iff every capability in `required` is claimed by self.
    pub fn permits(self, required: SafetyFlags) -> bool {
        required.0 & !self.0 == 0
    }

    // Error-reporting form of permits, with self as the provider.
    pub fn check(self, required: SafetyFlags) -> Result<()> {
        if !self.is_valid() || !required.is_valid() {
            return Err(Error::InvalidFlags);
        }
        let missing = SafetyFlags(required.0 & !self.0);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Unavailable { missing })
        }
    }

    // Sorted lowercase names of the set bits.
    pub fn names(self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = BitFlags::from_bits_truncate(self.0)
            .iter()
            .map(Safety::name)
            .collect();
        names.sort_unstable();
        names
    }

    pub fn from_names<'a, I>(names: I) -> Result<SafetyFlags>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut flags = SafetyFlags::NOT_SAFE;
        for name in names {
            let flag = match name {
                "cpusafe" => Safety::CpuSafe,
                "memsafe" => Safety::MemSafe,
                "timesafe" => Safety::TimeSafe,
                "iosafe" => Safety::IoSafe,
                other => {
                    return Err(Error::Operation(format!(
                        "unknown capability name: {:?}",
                        other
                    )))
                }
            };
            flags = flags.union(flag.into());
        }
        Ok(flags)
    }
}

impl From<Safety> for SafetyFlags {
    fn from(flag: Safety) -> SafetyFlags {
        SafetyFlags(flag as u8)
    }
}

impl From<SafetySet> for SafetyFlags {
    fn from(set: SafetySet) -> SafetyFlags {
        SafetyFlags(set.bits())
    }
}

impl fmt::Display for SafetyFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "InvalidSafe({})", self.0);
        }
        if self.0 == 0 {
            return write!(f, "NotSafe");
        }
        // Canonical order is declaration order: CPU, memory, time, IO.
        let set: SafetySet = BitFlags::from_bits_truncate(self.0);
        let parts: Vec<&'static str> = set.iter().map(Safety::render).collect();
        if parts.len() == 1 {
            write!(f, "{}", parts[0])
        } else {
            write!(f, "({})", parts.join("|"))
        }
    }
}

impl fmt::Debug for SafetyFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
