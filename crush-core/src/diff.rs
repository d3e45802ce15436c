//! Character-level diff: Myers O(ND) middle-snake bisection with
//! diff-match-patch style cleanups.
//!
//! All lengths and positions are in Unicode scalar values (`char`s).

/// Kind of a single edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Delete,
    Equal,
    Insert,
}

pub type Edit = (Op, String);

/// Ordered edits turning a source text into a target text.
pub type EditScript = Vec<Edit>;

/// Compute the edit script turning `text1` into `text2`.
pub fn diff(text1: &str, text2: &str) -> EditScript {
    let a: Vec<char> = text1.chars().collect();
    let b: Vec<char> = text2.chars().collect();
    diff_chars(&a, &b)
}

/// Reassemble the source text of a script.
pub fn source_text(edits: &[Edit]) -> String {
    edits
        .iter()
        .filter(|(op, _)| *op != Op::Insert)
        .map(|(_, text)| text.as_str())
        .collect()
}

/// Reassemble the target text of a script.
pub fn target_text(edits: &[Edit]) -> String {
    edits
        .iter()
        .filter(|(op, _)| *op != Op::Delete)
        .map(|(_, text)| text.as_str())
        .collect()
}

/// Whether the script changes anything at all.
pub fn is_identity(edits: &[Edit]) -> bool {
    edits.iter().all(|(op, _)| *op == Op::Equal)
}

/// Levenshtein distance implied by a script, in chars.
pub fn levenshtein(edits: &[Edit]) -> usize {
    let mut distance = 0;
    let mut insertions = 0;
    let mut deletions = 0;
    for (op, text) in edits {
        let len = text.chars().count();
        match op {
            Op::Insert => insertions += len,
            Op::Delete => deletions += len,
            Op::Equal => {
                distance += insertions.max(deletions);
                insertions = 0;
                deletions = 0;
            }
        }
    }
    distance + insertions.max(deletions)
}

/// Map a char offset in the source text to the equivalent offset in the
/// target text.
pub fn translate_index(edits: &[Edit], loc: usize) -> usize {
    let mut chars1 = 0;
    let mut chars2 = 0;
    let mut last_chars1 = 0;
    let mut last_chars2 = 0;
    let mut stopped_on = None;
    for (op, text) in edits {
        let len = text.chars().count();
        if *op != Op::Insert {
            chars1 += len;
        }
        if *op != Op::Delete {
            chars2 += len;
        }
        if chars1 > loc {
            stopped_on = Some(*op);
            break;
        }
        last_chars1 = chars1;
        last_chars2 = chars2;
    }
    if stopped_on == Some(Op::Delete) {
        // Inside a deletion: land on its start.
        return last_chars2;
    }
    last_chars2 + (loc - last_chars1)
}

// ── Core algorithm ───────────────────────────────────────────────────────

pub(crate) fn diff_chars(a: &[char], b: &[char]) -> EditScript {
    if a == b {
        return if a.is_empty() {
            Vec::new()
        } else {
            vec![(Op::Equal, collect(a))]
        };
    }

    let prefix_len = common_prefix(a, b);
    let (prefix, a) = a.split_at(prefix_len);
    let b = &b[prefix_len..];

    let suffix_len = common_suffix(a, b);
    let (a, suffix) = a.split_at(a.len() - suffix_len);
    let b = &b[..b.len() - suffix_len];

    let mut edits = compute(a, b);
    if !prefix.is_empty() {
        edits.insert(0, (Op::Equal, collect(prefix)));
    }
    if !suffix.is_empty() {
        edits.push((Op::Equal, collect(suffix)));
    }
    cleanup_merge(&mut edits);
    edits
}

/// Diff two texts that share no common prefix or suffix.
fn compute(a: &[char], b: &[char]) -> EditScript {
    if a.is_empty() {
        return vec![(Op::Insert, collect(b))];
    }
    if b.is_empty() {
        return vec![(Op::Delete, collect(a))];
    }

    let a_is_longer = a.len() > b.len();
    let (long, short) = if a_is_longer { (a, b) } else { (b, a) };
    if let Some(idx) = find(long, short, 0) {
        let op = if a_is_longer { Op::Delete } else { Op::Insert };
        return [
            (op, collect(&long[..idx])),
            (Op::Equal, collect(short)),
            (op, collect(&long[idx + short.len()..])),
        ]
        .into_iter()
        .filter(|(_, text)| !text.is_empty())
        .collect();
    }

    if short.len() == 1 {
        return vec![(Op::Delete, collect(a)), (Op::Insert, collect(b))];
    }

    bisect(a, b)
}

/// Find the middle snake and recurse on both halves.
fn bisect(a: &[char], b: &[char]) -> EditScript {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max_d = (n + m + 1) / 2;
    let v_offset = max_d;
    let v_length = 2 * max_d;
    let mut v1 = vec![-1isize; v_length as usize];
    let mut v2 = vec![-1isize; v_length as usize];
    v1[(v_offset + 1) as usize] = 0;
    v2[(v_offset + 1) as usize] = 0;

    let delta = n - m;
    // Odd delta: the forward path detects the overlap.
    let front = delta % 2 != 0;

    let mut k1start = 0;
    let mut k1end = 0;
    let mut k2start = 0;
    let mut k2end = 0;

    for d in 0..max_d {
        let mut k1 = -d + k1start;
        while k1 <= d - k1end {
            let k1_offset = (v_offset + k1) as usize;
            let mut x1 = if k1 == -d || (k1 != d && v1[k1_offset - 1] < v1[k1_offset + 1]) {
                v1[k1_offset + 1]
            } else {
                v1[k1_offset - 1] + 1
            };
            let mut y1 = x1 - k1;
            while x1 < n && y1 < m && a[x1 as usize] == b[y1 as usize] {
                x1 += 1;
                y1 += 1;
            }
            v1[k1_offset] = x1;
            if x1 > n {
                k1end += 2;
            } else if y1 > m {
                k1start += 2;
            } else if front {
                let k2_offset = v_offset + delta - k1;
                if k2_offset >= 0 && k2_offset < v_length && v2[k2_offset as usize] != -1 {
                    let x2 = n - v2[k2_offset as usize];
                    if x1 >= x2 {
                        return bisect_split(a, b, x1 as usize, y1 as usize);
                    }
                }
            }
            k1 += 2;
        }

        let mut k2 = -d + k2start;
        while k2 <= d - k2end {
            let k2_offset = (v_offset + k2) as usize;
            let mut x2 = if k2 == -d || (k2 != d && v2[k2_offset - 1] < v2[k2_offset + 1]) {
                v2[k2_offset + 1]
            } else {
                v2[k2_offset - 1] + 1
            };
            let mut y2 = x2 - k2;
            while x2 < n && y2 < m && a[(n - x2 - 1) as usize] == b[(m - y2 - 1) as usize] {
                x2 += 1;
                y2 += 1;
            }
            v2[k2_offset] = x2;
            if x2 > n {
                k2end += 2;
            } else if y2 > m {
                k2start += 2;
            } else if !front {
                let k1_offset = v_offset + delta - k2;
                if k1_offset >= 0 && k1_offset < v_length && v1[k1_offset as usize] != -1 {
                    let x1 = v1[k1_offset as usize];
                    let y1 = v_offset + x1 - k1_offset;
                    if x1 >= n - x2 {
                        return bisect_split(a, b, x1 as usize, y1 as usize);
                    }
                }
            }
            k2 += 2;
        }
    }

    // No commonality at all.
    vec![(Op::Delete, collect(a)), (Op::Insert, collect(b))]
}

fn bisect_split(a: &[char], b: &[char], x: usize, y: usize) -> EditScript {
    let mut edits = diff_chars(&a[..x], &b[..y]);
    edits.extend(diff_chars(&a[x..], &b[y..]));
    edits
}

// ── Cleanups ─────────────────────────────────────────────────────────────

/// Merge runs of like edits, factor common affixes out of delete/insert
/// pairs and slide single edits over neighbouring equalities.
pub fn cleanup_merge(edits: &mut EditScript) {
    // Sentinel equality flushes the last run.
    edits.push((Op::Equal, String::new()));
    let mut pointer = 0;
    let mut count_delete = 0;
    let mut count_insert = 0;
    let mut text_delete = String::new();
    let mut text_insert = String::new();

    while pointer < edits.len() {
        if pointer + 1 < edits.len() && edits[pointer].1.is_empty() {
            edits.remove(pointer);
            continue;
        }
        match edits[pointer].0 {
            Op::Insert => {
                count_insert += 1;
                text_insert.push_str(&edits[pointer].1);
                pointer += 1;
            }
            Op::Delete => {
                count_delete += 1;
                text_delete.push_str(&edits[pointer].1);
                pointer += 1;
            }
            Op::Equal => {
                let run = count_delete + count_insert;
                if run > 0 {
                    let start = pointer - run;
                    if !text_delete.is_empty() && !text_insert.is_empty() {
                        let common = common_prefix_bytes(&text_insert, &text_delete);
                        if common > 0 {
                            let shared = text_insert[..common].to_string();
                            if start > 0 && edits[start - 1].0 == Op::Equal {
                                edits[start - 1].1.push_str(&shared);
                            } else {
                                edits.insert(0, (Op::Equal, shared));
                                pointer += 1;
                            }
                            text_insert.drain(..common);
                            text_delete.drain(..common);
                        }
                        let common = common_suffix_bytes(&text_insert, &text_delete);
                        if common > 0 {
                            let split = text_insert.len() - common;
                            let shared = text_insert.split_off(split);
                            text_delete.truncate(text_delete.len() - common);
                            edits[pointer].1.insert_str(0, &shared);
                        }
                    }

                    let start = pointer - run;
                    let mut merged = Vec::with_capacity(2);
                    if !text_delete.is_empty() {
                        merged.push((Op::Delete, std::mem::take(&mut text_delete)));
                    }
                    if !text_insert.is_empty() {
                        merged.push((Op::Insert, std::mem::take(&mut text_insert)));
                    }
                    let added = merged.len();
                    edits.splice(start..pointer, merged);
                    pointer = start + added;
                }

                if pointer > 0 && edits[pointer - 1].0 == Op::Equal {
                    let text = edits.remove(pointer).1;
                    edits[pointer - 1].1.push_str(&text);
                } else {
                    pointer += 1;
                }

                count_delete = 0;
                count_insert = 0;
                text_delete.clear();
                text_insert.clear();
            }
        }
    }
    if edits.last().is_some_and(|(_, text)| text.is_empty()) {
        edits.pop();
    }

    // Second pass: A<ins>BA</ins>C -> <ins>AB</ins>AC and the mirror case.
    let mut changes = false;
    let mut pointer = 1;
    while pointer + 1 < edits.len() {
        if edits[pointer - 1].0 == Op::Equal && edits[pointer + 1].0 == Op::Equal {
            let prev = edits[pointer - 1].1.clone();
            let next = edits[pointer + 1].1.clone();
            if edits[pointer].1.ends_with(prev.as_str()) {
                let cur = &edits[pointer].1;
                let shifted = format!("{prev}{}", &cur[..cur.len() - prev.len()]);
                edits[pointer].1 = shifted;
                edits[pointer + 1].1.insert_str(0, &prev);
                edits.remove(pointer - 1);
                changes = true;
            } else if edits[pointer].1.starts_with(next.as_str()) {
                edits[pointer - 1].1.push_str(&next);
                let cur = &edits[pointer].1;
                let shifted = format!("{}{next}", &cur[next.len()..]);
                edits[pointer].1 = shifted;
                edits.remove(pointer + 1);
                changes = true;
            }
        }
        pointer += 1;
    }
    if changes {
        cleanup_merge(edits);
    }
}

/// Collapse trivial equalities swamped by the edits around them, then split
/// out overlaps between adjacent deletions and insertions.
pub fn cleanup_semantic(edits: &mut EditScript) {
    let mut changes = false;
    let mut equalities: Vec<usize> = Vec::new();
    let mut last_equality: Option<String> = None;
    let mut pointer: isize = 0;
    let mut insertions_before = 0;
    let mut deletions_before = 0;
    let mut insertions_after = 0;
    let mut deletions_after = 0;

    while (pointer as usize) < edits.len() {
        let idx = pointer as usize;
        let (op, text) = &edits[idx];
        if *op == Op::Equal {
            equalities.push(idx);
            insertions_before = insertions_after;
            deletions_before = deletions_after;
            insertions_after = 0;
            deletions_after = 0;
            last_equality = Some(text.clone());
        } else {
            let len = text.chars().count();
            if *op == Op::Insert {
                insertions_after += len;
            } else {
                deletions_after += len;
            }
            let swamped = last_equality.as_ref().is_some_and(|eq| {
                let eq_len = eq.chars().count();
                eq_len > 0
                    && eq_len <= insertions_before.max(deletions_before)
                    && eq_len <= insertions_after.max(deletions_after)
            });
            if !swamped {
                pointer += 1;
                continue;
            }
            if let (Some(equality), Some(&at)) = (last_equality.take(), equalities.last()) {
                // Replace the equality with a delete + insert of the same text.
                edits.insert(at, (Op::Delete, equality));
                edits[at + 1].0 = Op::Insert;
                equalities.pop();
                equalities.pop();
                pointer = equalities.last().map_or(-1, |&p| p as isize);
                insertions_before = 0;
                deletions_before = 0;
                insertions_after = 0;
                deletions_after = 0;
                changes = true;
            }
        }
        pointer += 1;
    }

    if changes {
        cleanup_merge(edits);
    }

    // <del>abcxxx</del><ins>xxxdef</ins> -> <del>abc</del>xxx<ins>def</ins>
    let mut pointer = 1;
    while pointer < edits.len() {
        if edits[pointer - 1].0 == Op::Delete && edits[pointer].0 == Op::Insert {
            let deletion: Vec<char> = edits[pointer - 1].1.chars().collect();
            let insertion: Vec<char> = edits[pointer].1.chars().collect();
            let overlap1 = common_overlap(&deletion, &insertion);
            let overlap2 = common_overlap(&insertion, &deletion);
            if overlap1 >= overlap2 {
                if overlap1 > 0
                    && (2 * overlap1 >= deletion.len() || 2 * overlap1 >= insertion.len())
                {
                    edits.insert(pointer, (Op::Equal, collect(&insertion[..overlap1])));
                    edits[pointer - 1].1 = collect(&deletion[..deletion.len() - overlap1]);
                    edits[pointer + 1].1 = collect(&insertion[overlap1..]);
                    pointer += 1;
                }
            } else if 2 * overlap2 >= deletion.len() || 2 * overlap2 >= insertion.len() {
                edits.insert(pointer, (Op::Equal, collect(&deletion[..overlap2])));
                edits[pointer - 1] = (Op::Insert, collect(&insertion[..insertion.len() - overlap2]));
                edits[pointer + 1] = (Op::Delete, collect(&deletion[overlap2..]));
                pointer += 1;
            }
            pointer += 1;
        }
        pointer += 1;
    }
    edits.retain(|(_, text)| !text.is_empty());
}

// ── Char-slice helpers ───────────────────────────────────────────────────

pub(crate) fn collect(chars: &[char]) -> String {
    chars.iter().collect()
}

pub(crate) fn common_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

pub(crate) fn common_suffix(a: &[char], b: &[char]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Length of the longest suffix of `a` that is a prefix of `b`.
fn common_overlap(a: &[char], b: &[char]) -> usize {
    let len = a.len().min(b.len());
    (1..=len)
        .rev()
        .find(|&n| a[a.len() - n..] == b[..n])
        .unwrap_or(0)
}

/// First occurrence of `needle` in `haystack` at or after `from`.
pub(crate) fn find(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return (from <= haystack.len()).then_some(from);
    }
    if from >= haystack.len() || needle.len() > haystack.len() - from {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Last occurrence of `needle` in `haystack` starting at or before `from`.
pub(crate) fn rfind(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    let last_start = (haystack.len() - needle.len()).min(from);
    (0..=last_start)
        .rev()
        .find(|&i| haystack[i..i + needle.len()] == *needle)
}

fn common_prefix_bytes(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, x), y)| x != y)
        .map_or(a.len().min(b.len()), |((i, _), _)| i)
}

fn common_suffix_bytes(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.len_utf8())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(edits: &[(Op, &str)]) -> EditScript {
        edits.iter().map(|(op, t)| (*op, t.to_string())).collect()
    }

    #[test]
    fn test_diff_identical() {
        assert_eq!(diff("abc", "abc"), script(&[(Op::Equal, "abc")]));
        assert!(diff("", "").is_empty());
    }

    #[test]
    fn test_diff_from_empty() {
        assert_eq!(diff("", "hello"), script(&[(Op::Insert, "hello")]));
        assert_eq!(diff("hello", ""), script(&[(Op::Delete, "hello")]));
    }

    #[test]
    fn test_diff_simple_insert() {
        assert_eq!(
            diff("abc", "ab123c"),
            script(&[(Op::Equal, "ab"), (Op::Insert, "123"), (Op::Equal, "c")])
        );
    }

    #[test]
    fn test_diff_simple_delete() {
        assert_eq!(
            diff("a123bc", "abc"),
            script(&[(Op::Equal, "a"), (Op::Delete, "123"), (Op::Equal, "bc")])
        );
    }

    #[test]
    fn test_diff_two_insertions() {
        assert_eq!(
            diff("abc", "a123b456c"),
            script(&[
                (Op::Equal, "a"),
                (Op::Insert, "123"),
                (Op::Equal, "b"),
                (Op::Insert, "456"),
                (Op::Equal, "c"),
            ])
        );
    }

    #[test]
    fn test_diff_reconstructs_both_sides() {
        let pairs = [
            ("the quick brown fox", "the slow green fox jumps"),
            ("fn main() {}\n", "fn main() {\n    println!(\"hi\");\n}\n"),
            ("ünïcødé ✓", "unicode ✗ ünï"),
            ("abcdefghij", "jihgfedcba"),
        ];
        for (a, b) in pairs {
            let edits = diff(a, b);
            assert_eq!(source_text(&edits), a);
            assert_eq!(target_text(&edits), b);
        }
    }

    #[test]
    fn test_cleanup_merge_joins_like_edits() {
        let mut edits = script(&[(Op::Equal, "a"), (Op::Delete, "b"), (Op::Delete, "c"), (Op::Equal, "d")]);
        cleanup_merge(&mut edits);
        assert_eq!(edits, script(&[(Op::Equal, "a"), (Op::Delete, "bc"), (Op::Equal, "d")]));
    }

    #[test]
    fn test_cleanup_merge_factors_affixes() {
        let mut edits = script(&[(Op::Delete, "a"), (Op::Insert, "abc"), (Op::Delete, "dc")]);
        cleanup_merge(&mut edits);
        assert_eq!(
            edits,
            script(&[(Op::Equal, "a"), (Op::Delete, "d"), (Op::Insert, "b"), (Op::Equal, "c")])
        );
    }

    #[test]
    fn test_cleanup_merge_slides_edit_left() {
        let mut edits = script(&[(Op::Equal, "a"), (Op::Insert, "ba"), (Op::Equal, "c")]);
        cleanup_merge(&mut edits);
        assert_eq!(edits, script(&[(Op::Insert, "ab"), (Op::Equal, "ac")]));
    }

    #[test]
    fn test_cleanup_merge_drops_empty() {
        let mut edits = script(&[(Op::Equal, ""), (Op::Insert, "x"), (Op::Delete, "")]);
        cleanup_merge(&mut edits);
        assert_eq!(edits, script(&[(Op::Insert, "x")]));
    }

    #[test]
    fn test_cleanup_semantic_absorbs_small_equality() {
        let mut edits = script(&[(Op::Delete, "a"), (Op::Equal, "b"), (Op::Delete, "c")]);
        cleanup_semantic(&mut edits);
        assert_eq!(edits, script(&[(Op::Delete, "abc"), (Op::Insert, "b")]));
    }

    #[test]
    fn test_cleanup_semantic_keeps_large_equality() {
        let original = script(&[(Op::Delete, "ab"), (Op::Insert, "cd"), (Op::Equal, "12"), (Op::Delete, "e")]);
        let mut edits = original.clone();
        cleanup_semantic(&mut edits);
        assert_eq!(edits, original);
    }

    #[test]
    fn test_cleanup_semantic_overlap() {
        let mut edits = script(&[(Op::Delete, "abcxxx"), (Op::Insert, "xxxdef")]);
        cleanup_semantic(&mut edits);
        assert_eq!(
            edits,
            script(&[(Op::Delete, "abc"), (Op::Equal, "xxx"), (Op::Insert, "def")])
        );
    }

    #[test]
    fn test_cleanup_semantic_preserves_texts() {
        let mut edits = diff("The cat sat on the mat", "A dog stood by a rug");
        cleanup_semantic(&mut edits);
        assert_eq!(source_text(&edits), "The cat sat on the mat");
        assert_eq!(target_text(&edits), "A dog stood by a rug");
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein(&script(&[(Op::Delete, "abc"), (Op::Insert, "1234"), (Op::Equal, "xyz")])), 4);
        assert_eq!(levenshtein(&script(&[(Op::Equal, "xyz"), (Op::Delete, "abc"), (Op::Insert, "1234")])), 4);
        assert_eq!(levenshtein(&script(&[(Op::Delete, "abc"), (Op::Equal, "xyz"), (Op::Insert, "1234")])), 7);
    }

    #[test]
    fn test_translate_index() {
        let edits = script(&[(Op::Delete, "a"), (Op::Insert, "1234"), (Op::Equal, "xyz")]);
        assert_eq!(translate_index(&edits, 2), 5);
        let edits = script(&[(Op::Equal, "a"), (Op::Delete, "1234"), (Op::Equal, "xyz")]);
        assert_eq!(translate_index(&edits, 3), 1);
    }

    #[test]
    fn test_is_identity() {
        assert!(is_identity(&diff("same", "same")));
        assert!(is_identity(&[]));
        assert!(!is_identity(&diff("same", "sane")));
    }

    #[test]
    fn test_find_and_rfind() {
        let hay: Vec<char> = "abcabc".chars().collect();
        let needle: Vec<char> = "bc".chars().collect();
        assert_eq!(find(&hay, &needle, 0), Some(1));
        assert_eq!(find(&hay, &needle, 2), Some(4));
        assert_eq!(rfind(&hay, &needle, 6), Some(4));
        assert_eq!(rfind(&hay, &needle, 3), Some(1));
        assert_eq!(find(&hay, &needle, 5), None);
    }
}
