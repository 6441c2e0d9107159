/// Stable 32-bit hash of a message type name, used both by serializers (to
/// key their per-message entries) and by publishers (to resolve
/// `localMsgTypeIdForMsgType`). Must be the same function on both sides of a
/// topic, and stable across processes and restarts, so it is a plain
/// FNV-1a over the UTF-8 bytes rather than anything keyed on process state.
pub fn msg_type_id_for_name(name: &str) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_deterministic() {
        assert_eq!(msg_type_id_for_name("Foo"), msg_type_id_for_name("Foo"));
    }

    #[test]
    fn differs_for_different_names() {
        assert_ne!(msg_type_id_for_name("Foo"), msg_type_id_for_name("Bar"));
    }
}
