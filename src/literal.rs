/// Literal storage — interned strings and numbers shared across bytecode
///
/// Every constant a compiled-code block references goes through
/// `find_or_create_*`, so equal literals in different scripts share one heap
/// cell and snapshots get stable literal identities. Storage is a chain of
/// fixed-size items, each holding a handful of cps; lookup is a linear scan,
/// a miss fills the first vacant slot or appends a fresh item.
///
/// Pool-held strings and numbers carry the single-reference pool flag and
/// stay alive until the context is torn down.

use crate::heap::{Cp, Heap, HeapCell};
use crate::string::{NumberCell, StringCell};

/// Cps per storage item.
pub const LIT_ITEM_VALUE_COUNT: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct LiteralItem {
    pub values: [Cp; LIT_ITEM_VALUE_COUNT],
}

impl LiteralItem {
    fn empty() -> Self {
        LiteralItem { values: [Cp::NULL; LIT_ITEM_VALUE_COUNT] }
    }
}

#[derive(Debug, Default)]
pub struct LiteralStorage {
    strings: Vec<LiteralItem>,
    numbers: Vec<LiteralItem>,
}

/// Literal number equality: NaN equals NaN, everything else is bit identity
/// (so +0 and -0 intern separately).
#[inline]
pub fn literal_number_equals(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    a.to_bits() == b.to_bits()
}

impl LiteralStorage {
    pub fn new() -> Self {
        LiteralStorage::default()
    }

    /// Intern a string. Returns the shared cp, or None when the heap budget
    /// is exhausted.
    pub fn find_or_create_string(&mut self, heap: &mut Heap, text: &str) -> Option<Cp> {
        let probe = StringCell::from_str(text);

        let mut vacancy: Option<(usize, usize)> = None;
        for (item_ix, item) in self.strings.iter().enumerate() {
            for (slot_ix, &cp) in item.values.iter().enumerate() {
                if cp.is_null() {
                    if vacancy.is_none() {
                        vacancy = Some((item_ix, slot_ix));
                    }
                } else if heap.string(cp).equals(&probe) {
                    return Some(cp);
                }
            }
        }

        let mut cell = probe;
        cell.in_literal_pool = true;
        let cp = heap.try_alloc(HeapCell::Str(cell)).ok()?;
        self.insert(true, vacancy, cp);
        Some(cp)
    }

    /// Intern a number by the literal-equality rule.
    pub fn find_or_create_number(&mut self, heap: &mut Heap, value: f64) -> Option<Cp> {
        let mut vacancy: Option<(usize, usize)> = None;
        for (item_ix, item) in self.numbers.iter().enumerate() {
            for (slot_ix, &cp) in item.values.iter().enumerate() {
                if cp.is_null() {
                    if vacancy.is_none() {
                        vacancy = Some((item_ix, slot_ix));
                    }
                } else if literal_number_equals(heap.number(cp).value, value) {
                    return Some(cp);
                }
            }
        }

        let cp = heap.try_alloc(HeapCell::Number(NumberCell::new(value))).ok()?;
        self.insert(false, vacancy, cp);
        Some(cp)
    }

    fn insert(&mut self, string: bool, vacancy: Option<(usize, usize)>, cp: Cp) {
        let list = if string { &mut self.strings } else { &mut self.numbers };
        match vacancy {
            Some((item, slot)) => list[item].values[slot] = cp,
            None => {
                let mut item = LiteralItem::empty();
                item.values[0] = cp;
                list.push(item);
            }
        }
    }

    /// All interned string cps in storage order (snapshot layout order).
    pub fn all_strings(&self) -> Vec<Cp> {
        self.strings
            .iter()
            .flat_map(|item| item.values.iter().copied())
            .filter(|cp| !cp.is_null())
            .collect()
    }

    /// All interned number cps in storage order.
    pub fn all_numbers(&self) -> Vec<Cp> {
        self.numbers
            .iter()
            .flat_map(|item| item.values.iter().copied())
            .filter(|cp| !cp.is_null())
            .collect()
    }

    /// Tear down: release every pool reference. Only the context drop path
    /// calls this.
    pub fn clear(&mut self, heap: &mut Heap) {
        for cp in self.all_strings() {
            let cell = heap.string_mut(cp);
            debug_assert!(cell.in_literal_pool && cell.refs == 1);
            cell.refs -= 1;
            if cell.refs == 0 {
                heap.free(cp);
            }
        }
        for cp in self.all_numbers() {
            let cell = heap.number_mut(cp);
            cell.refs -= 1;
            if cell.refs == 0 {
                heap.free(cp);
            }
        }
        self.strings.clear();
        self.numbers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(256 * 1024)
    }

    #[test]
    fn test_string_interning_shares_cells() {
        let mut h = heap();
        let mut lit = LiteralStorage::new();
        let a = lit.find_or_create_string(&mut h, "factorial").unwrap();
        let b = lit.find_or_create_string(&mut h, "factorial").unwrap();
        let c = lit.find_or_create_string(&mut h, "other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(h.string(a).in_literal_pool);
    }

    #[test]
    fn test_fifth_literal_opens_second_item() {
        let mut h = heap();
        let mut lit = LiteralStorage::new();
        for i in 0..5 {
            lit.find_or_create_string(&mut h, &format!("lit{i}")).unwrap();
        }
        assert_eq!(lit.strings.len(), 2);
        assert_eq!(lit.all_strings().len(), 5);
    }

    #[test]
    fn test_number_equality_rule() {
        let mut h = heap();
        let mut lit = LiteralStorage::new();
        let pos = lit.find_or_create_number(&mut h, 0.0).unwrap();
        let neg = lit.find_or_create_number(&mut h, -0.0).unwrap();
        assert_ne!(pos, neg, "±0 intern separately");

        let n1 = lit.find_or_create_number(&mut h, f64::NAN).unwrap();
        let n2 = lit.find_or_create_number(&mut h, -f64::NAN).unwrap();
        assert_eq!(n1, n2, "every NaN is the same literal");

        let a = lit.find_or_create_number(&mut h, 42.0).unwrap();
        let b = lit.find_or_create_number(&mut h, 42.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut h = heap();
        let mut lit = LiteralStorage::new();
        lit.find_or_create_string(&mut h, "one").unwrap();
        lit.find_or_create_number(&mut h, 1.5).unwrap();
        let live_before = h.live_cells();
        assert_eq!(live_before, 2);
        lit.clear(&mut h);
        assert_eq!(h.live_cells(), 0);
    }
}
