/// Rounds `offset` up to the next multiple of `align` (`align` must be a
/// power of two). Used to place struct fields at their natural alignment
/// and to pad a struct's total size to its largest member, matching AAPCS
/// and AArch64 PCS composite-type layout rules.
pub fn align_up(offset: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

/// Computes the padded total size of a composite whose fields have the
/// given sizes and alignments, laid out in declaration order with no
/// reordering, and padded at the end to `max(aligns)`.
pub fn layout_struct(fields: &[(usize, usize)]) -> usize {
    let mut offset = 0usize;
    let mut max_align = 1usize;
    for &(size, align) in fields {
        max_align = max_align.max(align);
        offset = align_up(offset, align);
        offset += size;
    }
    align_up(offset, max_align)
}

/// Offsets of each field within a composite laid out as [`layout_struct`]
/// describes. The derive macro uses this to know where to write each
/// field's encoded bytes inside the composite's block.
pub fn field_offsets(fields: &[(usize, usize)]) -> Vec<usize> {
    let mut offset = 0usize;
    let mut offsets = Vec::with_capacity(fields.len());
    for &(size, align) in fields {
        offset = align_up(offset, align);
        offsets.push(offset);
        offset += size;
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(5, 8), 8);
    }

    #[test]
    fn layout_struct_pads_trailing_to_max_align() {
        // u8 then u32: field at offset 0 (size 1), padding to 4, field at
        // offset 4 (size 4), total size 8 (already aligned to 4).
        let size = layout_struct(&[(1, 1), (4, 4)]);
        assert_eq!(size, 8);
        assert_eq!(field_offsets(&[(1, 1), (4, 4)]), vec![0, 4]);
    }
}
