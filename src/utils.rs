use std::slice;

// Safety: T should be a #[repr(C)] plain-old-data struct.
pub(crate) unsafe fn to_bytes<T: Sized>(t: &T) -> &[u8] {
    slice::from_raw_parts(t as *const T as *const u8, std::mem::size_of::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Pair {
        a: u32,
        b: u32,
    }

    #[test]
    fn struct_view_matches_field_layout() {
        let pair = Pair { a: 1, b: 2 };
        let bytes = unsafe { to_bytes(&pair) };
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[..4], 1u32.to_ne_bytes());
        assert_eq!(bytes[4..], 2u32.to_ne_bytes());
    }
}
