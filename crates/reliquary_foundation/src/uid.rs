//! Globally unique, time-ordered entity identities.
//!
//! UIDs are in the form `C-TTTTTTTT`, where `C` is a short per-type code and
//! `T` is a time code: the issue time in 100 microsecond ticks since the Unix
//! epoch, rendered in base 58 over [`TIME_CODE_ALPHABET`].
//!
//! The generator remembers the last value it issued. A fresh clock reading
//! is used only when it is ahead of that value; otherwise the last value is
//! bumped by one. Bursts inside one tick, stalled clocks and clocks stepping
//! backwards therefore still produce strictly increasing time codes.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Characters used to render time codes, in ascending order.
///
/// `I`, `l`, `O` and `S` are left out so codes read unambiguously in any
/// font. Changing this after UIDs have been issued breaks their ordering.
pub const TIME_CODE_ALPHABET: &str = "0123456789aAbBcCdDeEfFgGhHijJkKLmMnNopPqQrRstTuUvVwWxXyYzZ";

/// Clock ticks per second (100 microsecond precision).
///
/// Changing this after UIDs have been issued risks duplicate UIDs.
pub const TIME_CODE_MULTIPLIER: u64 = 10_000;

const BASE: u64 = TIME_CODE_ALPHABET.len() as u64;

/// Renders a time value as a time code.
#[must_use]
pub fn encode_time_code(mut value: u64) -> String {
    let alphabet = TIME_CODE_ALPHABET.as_bytes();
    if value == 0 {
        return char::from(alphabet[0]).to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        #[allow(clippy::cast_possible_truncation)]
        digits.push(alphabet[(value % BASE) as usize]);
        value /= BASE;
    }
    digits.reverse();
    digits.into_iter().map(char::from).collect()
}

/// Parses a time code back into its time value.
///
/// Returns `None` for empty codes, characters outside the alphabet, or
/// values that overflow.
#[must_use]
pub fn decode_time_code(code: &str) -> Option<u64> {
    if code.is_empty() {
        return None;
    }
    code.chars().try_fold(0u64, |acc, c| {
        let digit = TIME_CODE_ALPHABET.find(c)? as u64;
        acc.checked_mul(BASE)?.checked_add(digit)
    })
}

/// Reads the system clock in time-code ticks.
#[must_use]
pub fn system_ticks() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() * TIME_CODE_MULTIPLIER + u64::from(d.subsec_micros()) / 100)
        .unwrap_or_default()
}

/// An immutable entity identity.
///
/// Cloning is O(1).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(Arc<str>);

impl Uid {
    /// Joins a type code and time code into a UID.
    #[must_use]
    pub fn new(type_code: &str, time_code: &str) -> Self {
        Self(Arc::from(format!("{type_code}-{time_code}")))
    }

    /// Returns the UID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the type code prefix.
    #[must_use]
    pub fn type_code(&self) -> &str {
        self.0.split_once('-').map_or(&*self.0, |(code, _)| code)
    }

    /// Returns the time code suffix, empty for UIDs without one.
    #[must_use]
    pub fn time_code(&self) -> &str {
        self.0.split_once('-').map_or("", |(_, time)| time)
    }

    /// Decodes the time code, if it is well formed.
    #[must_use]
    pub fn time_value(&self) -> Option<u64> {
        decode_time_code(self.time_code())
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl AsRef<str> for Uid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Uid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static GLOBAL: UidGenerator = UidGenerator::new();

/// Issues UIDs with strictly increasing time codes.
///
/// The last issued value is an atomic, so one generator can be shared across
/// threads without a lock.
pub struct UidGenerator {
    last: AtomicU64,
    clock: fn() -> u64,
}

impl UidGenerator {
    /// Creates a generator reading the system clock.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_clock(system_ticks)
    }

    /// Creates a generator reading ticks from `clock`.
    #[must_use]
    pub const fn with_clock(clock: fn() -> u64) -> Self {
        Self {
            last: AtomicU64::new(0),
            clock,
        }
    }

    /// Returns the process-wide generator.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Issues the next time value.
    pub fn next_time_value(&self) -> u64 {
        let now = (self.clock)();
        let advance = |last: u64| if now > last { now } else { last.wrapping_add(1) };
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(advance(last)))
            .unwrap_or_else(|last| last);
        advance(previous)
    }

    /// Issues a new UID for the given type code.
    pub fn next_uid(&self, type_code: &str) -> Uid {
        Uid::new(type_code, &encode_time_code(self.next_time_value()))
    }

    /// Returns the last issued time value (0 if none).
    #[must_use]
    pub fn last_issued(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UidGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UidGenerator")
            .field("last", &self.last_issued())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "serde")]
mod serde_support {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Uid;

    impl Serialize for Uid {
        fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            serializer.serialize_str(self.as_str())
        }
    }

    impl<'de> Deserialize<'de> for Uid {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
            String::deserialize(deserializer).map(Uid::from)
        }
    }
}
