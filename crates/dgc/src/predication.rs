use crate::memory::{DeviceMemory, MemoryError};

/// Conditional execution of a generated buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Predication {
    /// Address of a 32-bit condition word.
    pub address: u64,
    /// Execute when the word is zero instead of non-zero.
    pub inverted: bool,
}

/// Evaluates a [`Predication`] the way the generator program does.
///
/// A failed condition does not skip generation; it forces the effective sequence count to zero
/// so the output stays well formed.
pub struct PredicationGate;

impl PredicationGate {
    pub fn passes(memory: &dyn DeviceMemory, predication: &Predication) -> Result<bool, MemoryError> {
        let word = memory.read_u32(predication.address)?;
        Ok((word != 0) ^ predication.inverted)
    }

    /// Sequence count left after predication.
    pub fn effective_count(
        memory: &dyn DeviceMemory,
        predication: Option<&Predication>,
        count: u32,
    ) -> Result<u32, MemoryError> {
        match predication {
            Some(p) if !Self::passes(memory, p)? => Ok(0),
            _ => Ok(count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VecDeviceMemory;

    #[test]
    fn condition_word_and_inversion() {
        let mem = VecDeviceMemory::new(0x100, 16);
        let p = Predication {
            address: 0x104,
            inverted: false,
        };
        let inv = Predication { inverted: true, ..p };

        assert!(!PredicationGate::passes(&mem, &p).unwrap());
        assert!(PredicationGate::passes(&mem, &inv).unwrap());

        mem.write_u32(0x104, 7).unwrap();
        assert!(PredicationGate::passes(&mem, &p).unwrap());
        assert!(!PredicationGate::passes(&mem, &inv).unwrap());

        assert_eq!(PredicationGate::effective_count(&mem, Some(&inv), 9).unwrap(), 0);
        assert_eq!(PredicationGate::effective_count(&mem, Some(&p), 9).unwrap(), 9);
        assert_eq!(PredicationGate::effective_count(&mem, None, 9).unwrap(), 9);
    }

    #[test]
    fn unreadable_condition_is_an_error() {
        let mem = VecDeviceMemory::new(0x100, 16);
        let p = Predication {
            address: 0x200,
            inverted: false,
        };
        assert!(PredicationGate::passes(&mem, &p).is_err());
    }
}
