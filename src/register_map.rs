//! Sparse register storage for one logical read
//!
//! Registers are keyed by their offset from the read's base address. The first value
//! stored at an offset is kept; later writes to the same offset are ignored so a
//! sub-range can never clobber another one's data.

use std::collections::BTreeMap;
use log::warn;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterMap {
    registers: BTreeMap<u16, u16>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `values` at consecutive offsets starting at `offset`
    ///
    /// Returns how many values were actually stored.
    pub fn insert_block(&mut self, offset: u16, values: &[u16]) -> usize {
        let mut stored = 0;
        for (i, &value) in values.iter().enumerate() {
            let Some(slot) = offset.checked_add(i as u16) else {
                warn!("Register block at +{} overflows the offset space", offset);
                break;
            };
            match self.registers.get(&slot) {
                Some(&existing) if existing != value => {
                    warn!(
                        "Ignoring conflicting value 0x{:04X} at +{} (kept 0x{:04X})",
                        value, slot, existing
                    );
                }
                Some(_) => {}
                None => {
                    self.registers.insert(slot, value);
                    stored += 1;
                }
            }
        }
        stored
    }

    pub fn get(&self, offset: u16) -> Option<u16> {
        self.registers.get(&offset).copied()
    }

    pub fn contains(&self, offset: u16) -> bool {
        self.registers.contains_key(&offset)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Dense array of `span` registers; unread offsets are zero
    pub fn into_dense(self, span: usize) -> Vec<u16> {
        let mut dense = vec![0u16; span];
        for (offset, value) in self.registers {
            if let Some(slot) = dense.get_mut(offset as usize) {
                *slot = value;
            }
        }
        dense
    }
}
