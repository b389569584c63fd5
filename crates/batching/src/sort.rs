/// Stable bottom-up merge sort. `scratch` is reused between calls so a
/// warmed-up queue sorts without allocating.
pub fn merge_sort_by<T: Copy, F>(items: &mut [T], scratch: &mut Vec<T>, mut is_less: F)
where
    F: FnMut(&T, &T) -> bool,
{
    let len = items.len();
    if len < 2 {
        return;
    }
    scratch.clear();
    scratch.extend_from_slice(items);

    let mut width = 1;
    let mut sorted_in_items = true;
    while width < len {
        if sorted_in_items {
            merge_pass(items, scratch, width, &mut is_less);
        } else {
            merge_pass(scratch, items, width, &mut is_less);
        }
        sorted_in_items = !sorted_in_items;
        width *= 2;
    }
    if !sorted_in_items {
        items.copy_from_slice(scratch);
    }
}

/// Merges adjacent runs of `width` from `src` into `dst`. Ties take the
/// left run first.
fn merge_pass<T: Copy, F>(src: &[T], dst: &mut [T], width: usize, is_less: &mut F)
where
    F: FnMut(&T, &T) -> bool,
{
    let len = src.len();
    let mut start = 0;
    while start < len {
        let mid = (start + width).min(len);
        let end = (start + 2 * width).min(len);
        let (mut left, mut right, mut out) = (start, mid, start);
        while left < mid && right < end {
            if is_less(&src[right], &src[left]) {
                dst[out] = src[right];
                right += 1;
            } else {
                dst[out] = src[left];
                left += 1;
            }
            out += 1;
        }
        let tail = mid - left;
        dst[out..out + tail].copy_from_slice(&src[left..mid]);
        out += tail;
        dst[out..out + (end - right)].copy_from_slice(&src[right..end]);
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::merge_sort_by;

    #[test]
    fn sorts_odd_lengths() {
        let mut scratch = Vec::new();
        for len in 0..40u32 {
            let mut items: Vec<u32> = (0..len).map(|i| (i * 7919 + 13) % 23).collect();
            let mut expected = items.clone();
            expected.sort();
            merge_sort_by(&mut items, &mut scratch, |a, b| a < b);
            assert_eq!(items, expected, "len {len}");
        }
    }

    #[test]
    fn equal_keys_keep_input_order() {
        let mut items: Vec<(u8, usize)> = [2, 0, 1, 0, 2, 1, 0, 2, 1]
            .into_iter()
            .enumerate()
            .map(|(i, key)| (key, i))
            .collect();
        merge_sort_by(&mut items, &mut Vec::new(), |a, b| a.0 < b.0);
        assert_eq!(
            items.iter().map(|(_, i)| *i).collect::<Vec<_>>(),
            vec![1, 3, 6, 2, 5, 8, 0, 4, 7]
        );
    }
}
