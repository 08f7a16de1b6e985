//! Per-signature function tables for indirect calls.
//!
//! Every function whose address is taken gets a stable slot in the table for
//! its signature. Slots never move once assigned; empty slots hold `"0"`.
//! At module epilogue each table is rounded up to a power of two so indirect
//! calls can mask the pointer with `length - 1`.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

pub(crate) struct FunctionTableSet {
    /// Signature string -> ordered slot list. Ordered map so table emission
    /// and metadata are deterministic.
    tables: BTreeMap<String, Vec<String>>,
    /// Mangled function name -> assigned slot index.
    indexed: FxHashMap<String, u32>,
    /// High-watermark for globally unique slots under
    /// `no_aliasing_function_pointers`.
    next_function_index: u32,
    reserved_function_pointers: u32,
    no_aliasing_function_pointers: bool,
}

impl FunctionTableSet {
    pub(crate) fn new(
        reserved_function_pointers: u32,
        no_aliasing_function_pointers: bool,
    ) -> FunctionTableSet {
        FunctionTableSet {
            tables: BTreeMap::new(),
            indexed: FxHashMap::default(),
            next_function_index: 0,
            reserved_function_pointers,
            no_aliasing_function_pointers,
        }
    }

    /// The table for a signature, created on first touch. Tables start with
    /// `2 * (R + 1)` empty slots when R runtime pointers are reserved (each
    /// reserved slot must be 2-aligned), and otherwise with one empty slot
    /// so that a null function pointer never lands on a real function.
    pub(crate) fn ensure_table(&mut self, sig: &str) -> &mut Vec<String> {
        let table = self.tables.entry(sig.to_owned()).or_default();
        let min_size = if self.reserved_function_pointers > 0 {
            2 * (self.reserved_function_pointers as usize + 1)
        } else {
            1
        };
        while table.len() < min_size {
            table.push("0".to_owned());
        }
        table
    }

    /// Slot index for a function, assigning one on first use.
    pub(crate) fn function_index(&mut self, mangled_name: &str, sig: &str) -> u32 {
        if let Some(index) = self.indexed.get(mangled_name) {
            return *index;
        }
        let no_aliasing = self.no_aliasing_function_pointers;
        let next = self.next_function_index as usize;
        let table = self.ensure_table(sig);
        if no_aliasing {
            while table.len() < next {
                table.push("0".to_owned());
            }
        }
        // XXX the alignment here is always 1. That is fine in the ARM-like
        // ABI we target, which allows unaligned functions; the one risk is a
        // caller that forces a function alignment and relies on it.
        let alignment = 1;
        while table.len() % alignment != 0 {
            table.push("0".to_owned());
        }
        let index = table.len() as u32;
        table.push(mangled_name.to_owned());
        self.indexed.insert(mangled_name.to_owned(), index);
        if no_aliasing {
            self.next_function_index = index + 1;
        }
        index
    }

    pub(crate) fn lookup_index(&self, mangled_name: &str) -> Option<u32> {
        self.indexed.get(mangled_name).copied()
    }

    /// Pads every table to the next power of two with `"0"` sentinels.
    pub(crate) fn round_to_powers_of_two(&mut self) {
        for table in self.tables.values_mut() {
            let mut size = 1usize;
            while size < table.len() {
                size <<= 1;
            }
            while table.len() < size {
                table.push("0".to_owned());
            }
        }
    }

    /// Final mask for indirect calls through a signature's table. Only valid
    /// after [`round_to_powers_of_two`](Self::round_to_powers_of_two).
    pub(crate) fn mask(&self, sig: &str) -> u32 {
        match self.tables.get(sig) {
            Some(table) => table.len() as u32 - 1,
            None => 0,
        }
    }

    pub(crate) fn signatures(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.tables.iter()
    }
}

/// Placeholder spliced into function bodies for the table mask of a
/// signature. Bodies are emitted before the tables reach their final
/// power-of-two size, so the mask value is patched in at module epilogue.
pub(crate) fn mask_placeholder(sig: &str) -> String {
    format!("#FM_{}#", sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_stable_and_first_touch() {
        let mut tables = FunctionTableSet::new(0, false);
        let a = tables.function_index("_a", "vi");
        let b = tables.function_index("_b", "vi");
        assert_eq!(a, 1); // slot 0 is the null sentinel
        assert_eq!(b, 2);
        assert_eq!(tables.function_index("_a", "vi"), a);
    }

    #[test]
    fn reserved_pointers_pad_the_prefix() {
        let mut tables = FunctionTableSet::new(2, false);
        let index = tables.function_index("_f", "v");
        // 2 * (2 + 1) = 6 reserved slots before the first real entry.
        assert_eq!(index, 6);
    }

    #[test]
    fn no_aliasing_gives_globally_unique_slots() {
        let mut tables = FunctionTableSet::new(0, true);
        let a = tables.function_index("_a", "vi");
        let b = tables.function_index("_b", "v");
        let c = tables.function_index("_c", "vi");
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert!(b > a && c > b);
    }

    #[test]
    fn rounding_makes_power_of_two_with_sentinels() {
        let mut tables = FunctionTableSet::new(0, false);
        for name in ["_a", "_b", "_c", "_d", "_e"] {
            tables.function_index(name, "vi");
        }
        tables.round_to_powers_of_two();
        let (_, table) = tables.iter().next().unwrap();
        assert_eq!(table.len(), 8);
        assert!(table[6..].iter().all(|slot| slot == "0"));
        assert_eq!(tables.mask("vi"), 7);
    }
}
