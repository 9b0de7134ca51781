mod globals;
mod header;
mod objects;
mod value;

pub use globals::Globals;
pub use header::{ObjectHeader, HASH_MASK};
pub use objects::{
    compare_symbols, Block, Class, Context, Dictionary, Method, Process,
    RawObject, Symbol,
};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;
    use core::cmp::Ordering;

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn small_integer_round_trip() {
        for &n in &[0i32, 1, -1, 42, -42, (1 << 30) - 1, -(1 << 30)] {
            let v = Value::from_i32(n);
            assert!(v.is_small_integer());
            assert!(!v.is_ref());
            assert_eq!(unsafe { v.as_i32() }, n);
        }
    }

    #[test]
    fn small_integer_encoding_formula() {
        assert_eq!(Value::from_i32(0).raw(), 1);
        assert_eq!(Value::from_i32(5).raw(), 11);
        assert_eq!(Value::from_i32(-1).raw(), (-1i64 as u64) | 1);
    }

    #[test]
    fn small_integer_range_gate() {
        assert!(Value::fits_small_integer(0));
        assert!(Value::fits_small_integer(Value::SMALL_INT_MAX));
        assert!(Value::fits_small_integer(Value::SMALL_INT_MIN));
        assert!(!Value::fits_small_integer(Value::SMALL_INT_MAX + 1));
        assert!(!Value::fits_small_integer(Value::SMALL_INT_MIN - 1));
    }

    #[test]
    fn ref_tagging() {
        let dummy: u64 = 0;
        let v = Value::from_ptr(&dummy as *const u64);
        assert!(v.is_ref());
        assert!(!v.is_small_integer());
        assert!(!v.is_null());
    }

    #[test]
    fn null_is_neither_ref_nor_integer() {
        assert!(Value::NULL.is_null());
        assert!(!Value::NULL.is_ref());
        assert!(!Value::NULL.is_small_integer());
    }

    // ── Header ─────────────────────────────────────────────────────

    #[test]
    fn header_field_extraction() {
        let h = ObjectHeader::new(Value::NULL, 7, false, 123);
        assert_eq!(h.size(), 7);
        assert!(!h.is_binary());
        assert!(!h.is_relocated());
        assert_eq!(h.hash(), 123);
        assert_eq!(h.payload_bytes(), 7 * 8);
        assert_eq!(h.total_bytes(), 16 + 56);
    }

    #[test]
    fn binary_payload_rounds_to_words() {
        let h = ObjectHeader::new(Value::NULL, 5, true, 0);
        assert!(h.is_binary());
        assert_eq!(h.size(), 5);
        assert_eq!(h.payload_bytes(), 8);
        let h = ObjectHeader::new(Value::NULL, 8, true, 0);
        assert_eq!(h.payload_bytes(), 8);
    }

    #[test]
    fn forwarding_overloads_class_word() {
        let mut h = ObjectHeader::new(Value::from_raw(0x1000), 2, false, 9);
        let target = Value::from_raw(0x2000);
        h.forward_to(target);
        assert!(h.is_relocated());
        assert_eq!(h.forwarded(), target);
        // size and hash survive forwarding
        assert_eq!(h.size(), 2);
        assert_eq!(h.hash(), 9);
    }

    // ── Symbols and dictionaries ───────────────────────────────────

    // Builds a fake binary symbol in a plain buffer; no heap needed.
    fn fake_symbol(buf: &mut Vec<u64>, text: &[u8]) -> Value {
        buf.clear();
        buf.resize(2 + text.len().div_ceil(8), 0);
        let ptr = buf.as_mut_ptr() as *mut RawObject;
        unsafe {
            (*ptr).header = ObjectHeader::new(Value::NULL, text.len(), true, 0);
            (*ptr).bytes_mut().copy_from_slice(text);
        }
        Value::from_ptr(ptr)
    }

    #[test]
    fn symbol_text_comparison() {
        let mut a_buf = Vec::new();
        let mut b_buf = Vec::new();
        let a = fake_symbol(&mut a_buf, b"at:put:");
        let b = fake_symbol(&mut b_buf, b"do:");
        unsafe {
            assert_eq!(compare_symbols(a, b), Ordering::Less);
            assert_eq!(compare_symbols(b, a), Ordering::Greater);
            assert_eq!(compare_symbols(a, a), Ordering::Equal);
        }
    }

    #[test]
    fn layout_constants() {
        assert_eq!(size_of::<ObjectHeader>(), 16);
        assert_eq!(size_of::<Context>(), 16 + Context::SLOT_COUNT * 8);
        assert_eq!(size_of::<Block>(), 16 + Block::SLOT_COUNT * 8);
        assert_eq!(size_of::<Class>(), 16 + Class::SLOT_COUNT * 8);
    }
}
