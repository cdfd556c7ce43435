//! UTF-8 continuation stitching for decoder tokens.
//!
//! The acoustic tokenizer works on bytes and may split a multi-byte
//! codepoint across successive tokens. The stitcher keeps a running
//! count of missing continuation bytes and merges buffered tokens until
//! the count reaches zero. Special tokens never merge.

use crate::decode::RawToken;
use crate::transcript::Token;

/// Count the UTF-8 continuation bytes still missing after `text`.
///
/// `carry` is the outstanding count from previous tokens. Illegal
/// sequences reset the count rather than propagate.
pub fn missing_utf8_bytes(text: &[u8], carry: u32) -> u32 {
    let mut expected = carry;
    for &b in text {
        if expected == 0 {
            expected = match b {
                _ if b & 0b1000_0000 == 0 => 0,
                _ if b & 0b1110_0000 == 0b1100_0000 => 1,
                _ if b & 0b1111_0000 == 0b1110_0000 => 2,
                _ if b & 0b1111_1000 == 0b1111_0000 => 3,
                // invalid lead byte: reset
                _ => 0,
            };
        } else if b & 0b1100_0000 == 0b1000_0000 {
            expected -= 1;
        } else {
            // invalid continuation: reset
            expected = 0;
        }
    }
    expected
}

/// Merge raw tokens with split codepoints and produce public tokens.
///
/// A merged token spans `t0` of the first fragment to `t1` of the last,
/// keeps the first fragment's `id`/`tid`/`t_dtw`, sums `vlen`, and
/// averages `p`/`plog`/`pt`/`ptsum` over the fragment count.
pub fn stitch_tokens(raw: Vec<RawToken>) -> Vec<Token> {
    let mut out = Vec::with_capacity(raw.len());
    let mut stack: Vec<RawToken> = Vec::new();
    let mut stack_missing = 0u32;

    for token in raw {
        if token.special {
            // Control tokens never merge; any dangling fragment run is
            // flushed as-is.
            if !stack.is_empty() {
                out.push(merge(std::mem::take(&mut stack)));
                stack_missing = 0;
            }
            out.push(finish(token));
            continue;
        }

        let missing = missing_utf8_bytes(&token.text, stack_missing);
        stack.push(token);
        if missing > 0 {
            stack_missing = missing;
            continue;
        }
        stack_missing = 0;
        out.push(merge(std::mem::take(&mut stack)));
    }

    if !stack.is_empty() {
        out.push(merge(stack));
    }

    out
}

fn finish(token: RawToken) -> Token {
    Token {
        id: token.id,
        tid: token.tid,
        p: token.p,
        plog: token.plog,
        pt: token.pt,
        ptsum: token.ptsum,
        t0: token.t0,
        t1: token.t1,
        t_dtw: token.t_dtw,
        vlen: token.vlen,
        special: token.special,
        text: String::from_utf8_lossy(&token.text).into_owned(),
    }
}

fn merge(fragments: Vec<RawToken>) -> Token {
    debug_assert!(!fragments.is_empty());
    if fragments.len() == 1 {
        return finish(fragments.into_iter().next().expect("one fragment"));
    }

    let n = fragments.len() as f32;
    let first = &fragments[0];
    let last = fragments.last().expect("non-empty");

    let mut text = Vec::new();
    let mut vlen = 0.0f32;
    let (mut p, mut plog, mut pt, mut ptsum) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    for fragment in &fragments {
        vlen += fragment.vlen;
        p += fragment.p;
        plog += fragment.plog;
        pt += fragment.pt;
        ptsum += fragment.ptsum;
    }
    let (t0, t1, t_dtw, id, tid) = (first.t0, last.t1, first.t_dtw, first.id, first.tid);
    for mut fragment in fragments {
        text.append(&mut fragment.text);
    }

    Token {
        id,
        tid,
        p: p / n,
        plog: plog / n,
        pt: pt / n,
        ptsum: ptsum / n,
        t0,
        t1,
        t_dtw,
        vlen,
        special: false,
        text: String::from_utf8_lossy(&text).into_owned(),
    }
}
