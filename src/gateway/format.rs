//! Message splitting, name truncation, and ping prefixes.
//!
//! All limits here count Unicode code points, not bytes: Discord caps
//! message content at 2000 code points and thread/channel names at 100.

use crate::config::MessagePingMode;

/// Discord's maximum message content length, in code points.
pub const MAX_MESSAGE_CODE_POINTS: usize = 2000;

/// Maximum thread/channel name length, in code points.
pub const MAX_NAME_CODE_POINTS: usize = 100;

/// Room a `(i/n) ` counter needs when `n` chunks exist: both numbers at
/// the width of `n`, plus the parens, slash, and trailing space.
fn counter_reserve(total: usize) -> usize {
    2 * decimal_digits(total) + 4
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Placeholder name for threads created before the conversation has one.
pub const PLACEHOLDER_NAME: &str = "New conversation";

fn code_points(s: &str) -> usize {
    s.chars().count()
}

/// Byte index of the `n`-th code point, or `s.len()` past the end.
fn byte_index_of(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}

/// Split `text` into pieces of at most `limit` code points, preferring
/// paragraph, then line, then space boundaries. A soft break is only
/// taken when it keeps the piece at least half the limit; otherwise the
/// cut is hard. Separators stay at the end of the piece they close, so
/// the concatenation of all pieces is exactly `text`.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    assert!(limit > 0);
    if code_points(text) <= limit {
        if text.is_empty() {
            return Vec::new();
        }
        return vec![text.to_owned()];
    }

    let mut pieces = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if code_points(remaining) <= limit {
            pieces.push(remaining.to_owned());
            break;
        }

        let window_end = byte_index_of(remaining, limit);
        let window = &remaining[..window_end];
        let min_take = byte_index_of(remaining, limit / 2);

        let soft = find_break(window, "\n\n", min_take)
            .or_else(|| find_break(window, "\n", min_take))
            .or_else(|| find_break(window, " ", min_take));

        let split_at = soft.unwrap_or(window_end);
        pieces.push(remaining[..split_at].to_owned());
        remaining = &remaining[split_at..];
    }

    pieces
}

/// Last occurrence of `delimiter` in `window` ending at or after
/// `min_take` bytes; returns the byte index just past the delimiter.
fn find_break(window: &str, delimiter: &str, min_take: usize) -> Option<usize> {
    window
        .rfind(delimiter)
        .map(|pos| pos + delimiter.len())
        .filter(|&end| end >= min_take)
}

/// Produce the wire-ready chunks for one post: split at 2000 code
/// points, add `(i/n) ` counters when more than one chunk results, and
/// put the optional ping prefix on the first chunk only. Splitting
/// boundaries are computed on the text alone; decorations get reserved
/// room instead of shifting them past the limit.
pub fn assemble_chunks(text: &str, ping_prefix: Option<&str>) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let prefix_len = ping_prefix.map_or(0, code_points);

    if prefix_len + code_points(text) <= MAX_MESSAGE_CODE_POINTS {
        return vec![match ping_prefix {
            Some(prefix) => format!("{prefix}{text}"),
            None => text.to_owned(),
        }];
    }

    // Multi-chunk: every chunk reserves counter room, the first also
    // reserves the prefix. The counter width depends on the final chunk
    // count, which depends on the reserve, so re-split with a wider
    // reserve whenever the count outgrows the current one.
    let mut reserve = counter_reserve(2);
    let (pieces, total) = loop {
        let first_limit = MAX_MESSAGE_CODE_POINTS
            .saturating_sub(reserve + prefix_len)
            .max(1);
        let rest_limit = MAX_MESSAGE_CODE_POINTS - reserve;

        let mut pieces = Vec::new();
        let first = split_message(text, first_limit);
        let Some((head, tail)) = first.split_first() else {
            return Vec::new();
        };
        pieces.push(head.clone());
        let tail_text = tail.concat();
        pieces.extend(split_message(&tail_text, rest_limit));

        let total = pieces.len();
        let needed = counter_reserve(total);
        if needed <= reserve {
            break (pieces, total);
        }
        reserve = needed;
    };
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            let counter = format!("({}/{total}) ", index + 1);
            if index == 0 {
                match ping_prefix {
                    Some(prefix) => format!("{prefix}{counter}{piece}"),
                    None => format!("{counter}{piece}"),
                }
            } else {
                format!("{counter}{piece}")
            }
        })
        .collect()
}

/// Truncate to 100 code points. Every rename call goes through this.
pub fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_NAME_CODE_POINTS).collect()
}

/// Lower-case, collapse anything outside `[a-z0-9_]` to `-`, squeeze
/// runs of `-`, trim edge dashes, cap at 100 code points.
pub fn sanitize_channel_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    trimmed.chars().take(MAX_NAME_CODE_POINTS).collect()
}

/// Compute the ping prefix for one outbound post. The recent speaker,
/// when used, has already been consumed by the caller.
pub fn ping_prefix(
    mode: MessagePingMode,
    invite_user_ids: &[String],
    recent_speaker: Option<&str>,
) -> Option<String> {
    match mode {
        MessagePingMode::Never => None,
        MessagePingMode::Always => {
            if invite_user_ids.is_empty() {
                return None;
            }
            let mentions: Vec<String> = invite_user_ids
                .iter()
                .map(|id| format!("<@{id}>"))
                .collect();
            Some(format!("{} ", mentions.join(" ")))
        }
        MessagePingMode::OnRecentUserMessage => {
            recent_speaker.map(|user_id| format!("<@{user_id}> "))
        }
    }
}
