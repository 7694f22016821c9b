//! Pickup verification codes: a 6-digit code bound to a ride at accept time
//! and checked once at physical pickup.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Uniform random 6-digit decimal code. Collisions across rides are fine,
/// the code is only ever checked against its own ride.
pub fn generate() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..=999_999);
    format!("{n:06}")
}

pub fn verify(stored: &str, candidate: &str) -> bool {
    stored == candidate
}

/// Expiry is a policy knob, disabled by default: the upstream product shipped
/// with the countdown turned off, so `None` means codes never age out.
pub fn expired(
    generated_at: DateTime<Utc>,
    now: DateTime<Utc>,
    ttl: Option<Duration>,
) -> bool {
    match ttl {
        Some(ttl) => now - generated_at > ttl,
        None => false,
    }
}
