use crate::Value;

/// The persistent globals handed out by the image loader.
///
/// Every field is a slot the collector must keep valid across flips; the VM
/// registers each one as a static root right after load.
#[derive(Debug)]
pub struct Globals {
    /// The canonical `nil` object.
    pub nil: Value,

    /// The canonical `true` object.
    pub true_obj: Value,

    /// The canonical `false` object.
    pub false_obj: Value,

    /// Class of inline small integers (they carry no header of their own).
    pub small_int_class: Value,

    /// Class of plain object arrays.
    pub array_class: Value,

    /// Class of block closures.
    pub block_class: Value,

    /// Class of activation records.
    pub context_class: Value,

    /// Class of byte strings.
    pub string_class: Value,

    /// Class small-integer arithmetic promotes to on overflow.
    pub integer_class: Value,

    /// The system dictionary of named globals.
    pub globals_dictionary: Value,

    /// The bootstrap method the first process runs.
    pub initial_method: Value,

    /// Selectors for the inlined binary sends, in opcode order: `<`, `<=`, `+`.
    pub binary_selectors: [Value; 3],

    /// The `doesNotUnderstand:` selector used for the lookup-failure resend.
    pub bad_method_symbol: Value,
}

impl Globals {
    #[inline(always)]
    pub fn is_nil(&self, value: Value) -> bool {
        value == self.nil
    }

    /// Visit every globals slot, static-root style.
    pub fn visit_slots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.nil);
        visitor(&mut self.true_obj);
        visitor(&mut self.false_obj);
        visitor(&mut self.small_int_class);
        visitor(&mut self.array_class);
        visitor(&mut self.block_class);
        visitor(&mut self.context_class);
        visitor(&mut self.string_class);
        visitor(&mut self.integer_class);
        visitor(&mut self.globals_dictionary);
        visitor(&mut self.initial_method);
        for selector in &mut self.binary_selectors {
            visitor(selector);
        }
        visitor(&mut self.bad_method_symbol);
    }
}
