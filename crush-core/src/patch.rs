//! Context-anchored patches: build from an edit script, serialize to the
//! diff-match-patch text format, and apply with fuzzy matching.
//!
//! Text format:
//! ```text
//! @@ -start1,length1 +start2,length2 @@
//!  context
//! -deleted
//! +inserted
//! ```
//!
//! Line bodies are percent-encoded (URI-safe punctuation and spaces are kept
//! as-is). Positions count `char`s.
//!
//! Applying never fails: hunks whose context cannot be located within the
//! match threshold are skipped and reported as `false` in
//! [`Applied::results`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::diff::{self, collect, Edit, EditScript, Op};

/// Context chars kept around each hunk.
pub const PATCH_MARGIN: usize = 4;
/// Width of the Bitap match window; longer hunks are split.
pub const MATCH_MAX_BITS: usize = 32;
/// 0.0 requires a perfect match, 1.0 accepts anything.
const MATCH_THRESHOLD: f64 = 0.5;
/// How far from the expected location a match may drift before its score
/// reaches 1.0.
const MATCH_DISTANCE: f64 = 1000.0;
/// Maximum edit ratio tolerated inside a located long hunk.
const DELETE_THRESHOLD: f64 = 0.5;
/// Largest position or length accepted in a hunk header. Sums of a few
/// header values stay below `isize::MAX`.
const MAX_COORDINATE: usize = isize::MAX as usize / 4;

/// Characters `encodeURI` leaves untouched that `urlencoding` escapes.
const URI_SAFE: [(&str, &str); 17] = [
    ("%20", " "),
    ("%21", "!"),
    ("%23", "#"),
    ("%24", "$"),
    ("%26", "&"),
    ("%27", "'"),
    ("%28", "("),
    ("%29", ")"),
    ("%2A", "*"),
    ("%2B", "+"),
    ("%2C", ","),
    ("%2F", "/"),
    ("%3A", ":"),
    ("%3B", ";"),
    ("%3D", "="),
    ("%3F", "?"),
    ("%40", "@"),
];

/// Patch parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("Malformed patch line: {0:?}")]
    Malformed(String),
    #[error("Invalid percent-encoding in patch body: {0}")]
    Encoding(String),
}

/// One context-anchored group of edits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hunk {
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
    pub edits: EditScript,
}

impl fmt::Display for Hunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "@@ -{} +{} @@",
            coords(self.start1, self.length1),
            coords(self.start2, self.length2)
        )?;
        for (op, text) in &self.edits {
            let sign = match op {
                Op::Insert => '+',
                Op::Delete => '-',
                Op::Equal => ' ',
            };
            writeln!(f, "{sign}{}", encode(text))?;
        }
        Ok(())
    }
}

/// Outcome of [`PatchSet::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub text: String,
    /// One flag per applied hunk (after oversized hunks were split).
    pub results: Vec<bool>,
}

impl Applied {
    pub fn applied(&self) -> usize {
        self.results.iter().filter(|ok| **ok).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.len() - self.applied()
    }
}

/// An ordered list of hunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    hunks: Vec<Hunk>,
}

/// Diff `base` against `target` and package the result as a patch.
///
/// Scripts longer than two edits get a semantic cleanup pass first, which
/// keeps patches readable and small.
pub fn make_patch(base: &str, target: &str) -> PatchSet {
    let mut edits = diff::diff(base, target);
    if edits.len() > 2 {
        diff::cleanup_semantic(&mut edits);
    }
    PatchSet::make(base, &edits)
}

impl PatchSet {
    /// Group `edits` (a script whose source text is `base`) into hunks with
    /// enough surrounding context to be located unambiguously.
    pub fn make(base: &str, edits: &[Edit]) -> Self {
        let mut hunks = Vec::new();
        if diff::is_identity(edits) {
            return Self { hunks };
        }

        let mut hunk = Hunk::default();
        let mut count1 = 0;
        let mut count2 = 0;
        // Hunk positions are relative to the text with all previous hunks
        // applied.
        let mut prepatch: Vec<char> = base.chars().collect();
        let mut postpatch = prepatch.clone();

        for (x, (op, text)) in edits.iter().enumerate() {
            let len = text.chars().count();
            if hunk.edits.is_empty() && *op != Op::Equal {
                hunk.start1 = count1;
                hunk.start2 = count2;
            }

            match op {
                Op::Insert => {
                    hunk.edits.push((*op, text.clone()));
                    hunk.length2 += len;
                    let at = count2.min(postpatch.len());
                    postpatch.splice(at..at, text.chars());
                }
                Op::Delete => {
                    hunk.edits.push((*op, text.clone()));
                    hunk.length1 += len;
                    let from = count2.min(postpatch.len());
                    let to = (count2 + len).min(postpatch.len());
                    postpatch.drain(from..to);
                }
                Op::Equal => {
                    if len <= 2 * PATCH_MARGIN && !hunk.edits.is_empty() && x + 1 != edits.len() {
                        hunk.edits.push((*op, text.clone()));
                        hunk.length1 += len;
                        hunk.length2 += len;
                    } else if len >= 2 * PATCH_MARGIN && !hunk.edits.is_empty() {
                        add_context(&mut hunk, &prepatch);
                        hunks.push(std::mem::take(&mut hunk));
                        prepatch = postpatch.clone();
                        count1 = count2;
                    }
                }
            }

            if *op != Op::Insert {
                count1 += len;
            }
            if *op != Op::Delete {
                count2 += len;
            }
        }

        if !hunk.edits.is_empty() {
            add_context(&mut hunk, &prepatch);
            hunks.push(hunk);
        }
        Self { hunks }
    }

    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Serialize to the textual wire format.
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    /// Parse the textual wire format.
    pub fn from_text(text: &str) -> Result<Self, PatchError> {
        let mut hunks = Vec::new();
        let mut lines = text.split('\n').peekable();

        while let Some(line) = lines.next() {
            if line.is_empty() {
                continue;
            }
            let mut hunk = parse_header(line)?;
            while let Some(&next) = lines.peek() {
                let mut chars = next.chars();
                let Some(sign) = chars.next() else {
                    lines.next();
                    continue;
                };
                let op = match sign {
                    '+' => Op::Insert,
                    '-' => Op::Delete,
                    ' ' => Op::Equal,
                    '@' => break,
                    _ => return Err(PatchError::Malformed(next.to_string())),
                };
                hunk.edits.push((op, decode(chars.as_str())?));
                lines.next();
            }
            hunks.push(hunk);
        }

        Ok(Self { hunks })
    }

    /// Apply to `text`, locating each hunk by fuzzy match around its
    /// expected position. Hunks that cannot be located are skipped.
    pub fn apply(&self, text: &str) -> Applied {
        if self.hunks.is_empty() {
            return Applied {
                text: text.to_string(),
                results: Vec::new(),
            };
        }

        let mut hunks = self.hunks.clone();
        let padding = add_padding(&mut hunks);
        let mut chars: Vec<char> = Vec::with_capacity(text.len() + 2 * padding.len());
        chars.extend(&padding);
        chars.extend(text.chars());
        chars.extend(&padding);
        split_max(&mut hunks);

        // Drift between expected and actual positions so far.
        let mut delta: isize = 0;
        let mut results = Vec::with_capacity(hunks.len());
        for hunk in &hunks {
            results.push(apply_hunk(hunk, &mut chars, &mut delta));
        }

        let start = padding.len().min(chars.len());
        let end = chars.len().saturating_sub(padding.len()).max(start);
        Applied {
            text: collect(&chars[start..end]),
            results,
        }
    }
}

impl fmt::Display for PatchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hunk in &self.hunks {
            write!(f, "{hunk}")?;
        }
        Ok(())
    }
}

impl FromStr for PatchSet {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_text(s)
    }
}

fn apply_hunk(hunk: &Hunk, chars: &mut Vec<char>, delta: &mut isize) -> bool {
    let expected_loc = (hunk.start2 as isize).saturating_add(*delta);
    let text1: Vec<char> = diff::source_text(&hunk.edits).chars().collect();

    let mut end_loc = None;
    let start_loc = if text1.len() > MATCH_MAX_BITS {
        // Too long for one Bitap window: anchor both ends.
        let tail = text1.len() - MATCH_MAX_BITS;
        match_main(chars, &text1[..MATCH_MAX_BITS], expected_loc).and_then(|start| {
            match match_main(chars, &text1[tail..], expected_loc.saturating_add(tail as isize)) {
                Some(end) if start < end => {
                    end_loc = Some(end);
                    Some(start)
                }
                _ => None,
            }
        })
    } else {
        match_main(chars, &text1, expected_loc)
    };

    let Some(start_loc) = start_loc else {
        *delta = delta.saturating_sub(hunk.length2 as isize - hunk.length1 as isize);
        return false;
    };
    *delta = (start_loc as isize).saturating_sub(expected_loc);

    let found_end = match end_loc {
        Some(end) => end + MATCH_MAX_BITS,
        None => start_loc + text1.len(),
    };
    let text2 = slice(chars, start_loc, found_end).to_vec();

    if text1 == text2 {
        let end = (start_loc + text1.len()).min(chars.len());
        chars.splice(start_loc..end, diff::target_text(&hunk.edits).chars());
        return true;
    }

    // Imperfect match: map the hunk's edits through a diff of what we
    // expected against what we found.
    let drift = diff::diff_chars(&text1, &text2);
    if text1.len() > MATCH_MAX_BITS
        && diff::levenshtein(&drift) as f64 / text1.len() as f64 > DELETE_THRESHOLD
    {
        return false;
    }

    let mut index1 = 0;
    for (op, data) in &hunk.edits {
        let len = data.chars().count();
        match op {
            Op::Insert => {
                let at = (start_loc + diff::translate_index(&drift, index1)).min(chars.len());
                chars.splice(at..at, data.chars());
            }
            Op::Delete => {
                let from = (start_loc + diff::translate_index(&drift, index1)).min(chars.len());
                let to = (start_loc + diff::translate_index(&drift, index1 + len))
                    .min(chars.len())
                    .max(from);
                chars.drain(from..to);
            }
            Op::Equal => {}
        }
        if *op != Op::Delete {
            index1 += len;
        }
    }
    true
}

/// Grow the hunk's context until its pattern is unique in `text` (or the
/// match window is full), then add one more margin on each side.
fn add_context(hunk: &mut Hunk, text: &[char]) {
    if text.is_empty() {
        return;
    }
    let mut pattern = slice(text, hunk.start2, hunk.start2.saturating_add(hunk.length1));
    let mut padding = 0;
    while pattern.len() < MATCH_MAX_BITS - 2 * PATCH_MARGIN
        && diff::find(text, pattern, 0) != diff::rfind(text, pattern, text.len())
    {
        padding += PATCH_MARGIN;
        pattern = slice(
            text,
            hunk.start2.saturating_sub(padding),
            hunk.start2.saturating_add(hunk.length1 + padding),
        );
    }
    padding += PATCH_MARGIN;

    let prefix = slice(text, hunk.start2.saturating_sub(padding), hunk.start2);
    if !prefix.is_empty() {
        hunk.edits.insert(0, (Op::Equal, collect(prefix)));
    }
    let end = hunk.start2.saturating_add(hunk.length1);
    let suffix = slice(text, end, end.saturating_add(padding));
    if !suffix.is_empty() {
        hunk.edits.push((Op::Equal, collect(suffix)));
    }

    hunk.start1 = hunk.start1.saturating_sub(prefix.len());
    hunk.start2 = hunk.start2.saturating_sub(prefix.len());
    hunk.length1 = hunk.length1.saturating_add(prefix.len() + suffix.len());
    hunk.length2 = hunk.length2.saturating_add(prefix.len() + suffix.len());
}

/// Surround the text with sentinel chars so hunks at either edge still
/// have full context. Returns the sentinel.
fn add_padding(hunks: &mut [Hunk]) -> Vec<char> {
    let padding: Vec<char> = (1..=PATCH_MARGIN as u32).filter_map(char::from_u32).collect();
    let pad = padding.len();
    for hunk in hunks.iter_mut() {
        hunk.start1 = hunk.start1.saturating_add(pad);
        hunk.start2 = hunk.start2.saturating_add(pad);
    }

    if let Some(first) = hunks.first_mut() {
        match first.edits.first_mut() {
            Some((Op::Equal, text)) => {
                let len = text.chars().count();
                if len < pad {
                    let extra = pad - len;
                    text.insert_str(0, &collect(&padding[len..]));
                    first.start1 -= extra;
                    first.start2 -= extra;
                    first.length1 += extra;
                    first.length2 += extra;
                }
            }
            _ => {
                first.edits.insert(0, (Op::Equal, collect(&padding)));
                first.start1 -= pad;
                first.start2 -= pad;
                first.length1 += pad;
                first.length2 += pad;
            }
        }
    }

    if let Some(last) = hunks.last_mut() {
        match last.edits.last_mut() {
            Some((Op::Equal, text)) => {
                let len = text.chars().count();
                if len < pad {
                    let extra = pad - len;
                    text.push_str(&collect(&padding[..extra]));
                    last.length1 += extra;
                    last.length2 += extra;
                }
            }
            _ => {
                last.edits.push((Op::Equal, collect(&padding)));
                last.length1 += pad;
                last.length2 += pad;
            }
        }
    }

    padding
}

/// Break hunks whose base text exceeds the Bitap window into window-sized
/// pieces, each carrying a margin of context from its neighbours.
fn split_max(hunks: &mut Vec<Hunk>) {
    let window = MATCH_MAX_BITS;
    let mut x = 0;
    while x < hunks.len() {
        if hunks[x].length1 <= window {
            x += 1;
            continue;
        }
        let big = hunks.remove(x);
        let mut start1 = big.start1;
        let mut start2 = big.start2;
        let mut precontext: Vec<char> = Vec::new();
        let mut remaining: VecDeque<(Op, Vec<char>)> = big
            .edits
            .into_iter()
            .map(|(op, text)| (op, text.chars().collect()))
            .collect();

        while !remaining.is_empty() {
            let mut hunk = Hunk {
                start1: start1.saturating_sub(precontext.len()),
                start2: start2.saturating_sub(precontext.len()),
                ..Hunk::default()
            };
            let mut empty = true;
            if !precontext.is_empty() {
                hunk.length1 = precontext.len();
                hunk.length2 = precontext.len();
                hunk.edits.push((Op::Equal, collect(&precontext)));
            }

            while hunk.length1 < window - PATCH_MARGIN {
                let Some((op, text)) = remaining.front_mut() else {
                    break;
                };
                let op = *op;
                let len = text.len();
                if op == Op::Insert {
                    hunk.length2 += len;
                    start2 += len;
                    hunk.edits.push((op, collect(text)));
                    remaining.pop_front();
                    empty = false;
                } else if op == Op::Delete
                    && hunk.edits.len() == 1
                    && hunk.edits[0].0 == Op::Equal
                    && len > 2 * window
                {
                    // A huge deletion goes out whole.
                    hunk.length1 += len;
                    start1 += len;
                    hunk.edits.push((op, collect(text)));
                    remaining.pop_front();
                    empty = false;
                } else {
                    let take = len.min(window - hunk.length1 - PATCH_MARGIN);
                    hunk.length1 += take;
                    start1 += take;
                    if op == Op::Equal {
                        hunk.length2 += take;
                        start2 += take;
                    } else {
                        empty = false;
                    }
                    hunk.edits.push((op, collect(&text[..take])));
                    if take == len {
                        remaining.pop_front();
                    } else {
                        text.drain(..take);
                    }
                }
            }

            let target: Vec<char> = diff::target_text(&hunk.edits).chars().collect();
            precontext = target[target.len().saturating_sub(PATCH_MARGIN)..].to_vec();

            let postcontext: Vec<char> = remaining
                .iter()
                .filter(|(op, _)| *op != Op::Insert)
                .flat_map(|(_, text)| text.iter().copied())
                .take(PATCH_MARGIN)
                .collect();
            if !postcontext.is_empty() {
                hunk.length1 += postcontext.len();
                hunk.length2 += postcontext.len();
                match hunk.edits.last_mut() {
                    Some((Op::Equal, text)) => text.push_str(&collect(&postcontext)),
                    _ => hunk.edits.push((Op::Equal, collect(&postcontext))),
                }
            }

            if !empty {
                hunks.insert(x, hunk);
                x += 1;
            }
        }
    }
}

/// Locate `pattern` in `text` near `loc`.
fn match_main(text: &[char], pattern: &[char], loc: isize) -> Option<usize> {
    let loc = loc.clamp(0, text.len() as isize) as usize;
    if text == pattern {
        return Some(0);
    }
    if text.is_empty() {
        return None;
    }
    if loc + pattern.len() <= text.len() && text[loc..loc + pattern.len()] == *pattern {
        return Some(loc);
    }
    match_bitap(text, pattern, loc)
}

/// Bitap fuzzy search scoring both error count and distance from `loc`.
fn match_bitap(text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
    let plen = pattern.len();
    if plen == 0 || plen > MATCH_MAX_BITS {
        return None;
    }

    let mut alphabet: HashMap<char, u64> = HashMap::new();
    for (i, c) in pattern.iter().enumerate() {
        *alphabet.entry(*c).or_default() |= 1 << (plen - i - 1);
    }

    let score = |errors: usize, x: usize| -> f64 {
        let accuracy = errors as f64 / plen as f64;
        let proximity = loc.abs_diff(x) as f64;
        accuracy + proximity / MATCH_DISTANCE
    };

    let mut threshold = MATCH_THRESHOLD;
    if let Some(exact) = diff::find(text, pattern, loc) {
        threshold = threshold.min(score(0, exact));
        if let Some(exact) = diff::rfind(text, pattern, loc + plen) {
            threshold = threshold.min(score(0, exact));
        }
    }

    let match_mask = 1u64 << (plen - 1);
    let mut best_loc = None;
    let mut bin_max = plen + text.len();
    let mut last_rd: Vec<u64> = Vec::new();

    for d in 0..plen {
        // Binary search for how far from `loc` we can stray at this error level.
        let mut bin_min = 0;
        let mut bin_mid = bin_max;
        while bin_min < bin_mid {
            if score(d, loc + bin_mid) <= threshold {
                bin_min = bin_mid;
            } else {
                bin_max = bin_mid;
            }
            bin_mid = (bin_max - bin_min) / 2 + bin_min;
        }
        bin_max = bin_mid;

        let mut start = (loc as isize - bin_mid as isize + 1).max(1) as usize;
        let finish = (loc + bin_mid).min(text.len()) + plen;
        let mut rd = vec![0u64; finish + 2];
        rd[finish + 1] = (1u64 << d) - 1;

        let prev = |j: usize| last_rd.get(j).copied().unwrap_or(0);
        let mut j = finish;
        while j >= start {
            let char_match = text
                .get(j - 1)
                .and_then(|c| alphabet.get(c))
                .copied()
                .unwrap_or(0);
            rd[j] = if d == 0 {
                ((rd[j + 1] << 1) | 1) & char_match
            } else {
                (((rd[j + 1] << 1) | 1) & char_match)
                    | (((prev(j + 1) | prev(j)) << 1) | 1)
                    | prev(j + 1)
            };
            if rd[j] & match_mask != 0 {
                let candidate = score(d, j - 1);
                if candidate <= threshold {
                    threshold = candidate;
                    best_loc = Some(j - 1);
                    if j - 1 > loc {
                        // Don't search further left than the mirror of this hit.
                        start = (2 * loc as isize - (j - 1) as isize).max(1) as usize;
                    } else {
                        break;
                    }
                }
            }
            j -= 1;
        }

        if score(d + 1, loc) > threshold {
            break;
        }
        last_rd = rd;
    }

    best_loc
}

fn slice(text: &[char], start: usize, end: usize) -> &[char] {
    let end = end.min(text.len());
    let start = start.min(end);
    &text[start..end]
}

fn coords(start: usize, length: usize) -> String {
    match length {
        0 => format!("{start},0"),
        1 => format!("{}", start + 1),
        _ => format!("{},{length}", start + 1),
    }
}

fn parse_header(line: &str) -> Result<Hunk, PatchError> {
    let malformed = || PatchError::Malformed(line.to_string());
    let inner = line
        .strip_prefix("@@ -")
        .and_then(|rest| rest.strip_suffix(" @@"))
        .ok_or_else(malformed)?;
    let (left, right) = inner.split_once(" +").ok_or_else(malformed)?;
    let (start1, length1) = parse_coords(left).ok_or_else(malformed)?;
    let (start2, length2) = parse_coords(right).ok_or_else(malformed)?;
    Ok(Hunk {
        start1,
        start2,
        length1,
        length2,
        edits: Vec::new(),
    })
}

fn parse_coords(coords: &str) -> Option<(usize, usize)> {
    let (start, length) = match coords.split_once(',') {
        None => {
            let start: usize = coords.parse().ok()?;
            (start.checked_sub(1)?, 1)
        }
        Some((start, "0")) => (start.parse().ok()?, 0),
        Some((start, length)) => {
            let start: usize = start.parse().ok()?;
            (start.checked_sub(1)?, length.parse().ok()?)
        }
    };
    (start <= MAX_COORDINATE && length <= MAX_COORDINATE).then_some((start, length))
}

fn encode(text: &str) -> String {
    let mut out = urlencoding::encode(text).into_owned();
    for (escaped, plain) in URI_SAFE {
        if out.contains(escaped) {
            out = out.replace(escaped, plain);
        }
    }
    out
}

fn decode(text: &str) -> Result<String, PatchError> {
    urlencoding::decode(text)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| PatchError::Encoding(e.to_string()))
}
