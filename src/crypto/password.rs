//! Adaptive password hashing over bcrypt.

use crate::error::ServiceResult;

// bcrypt's MIN_COST/MAX_COST are private; these mirror its accepted range.
const MIN_COST: u32 = 4;
const MAX_COST: u32 = 31;

/// One-way password hasher with a configurable cost factor.
#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    cost: u32,
}

impl PasswordHasher {
    /// Cost is clamped to the range bcrypt accepts.
    #[must_use]
    pub fn new(cost: u32) -> Self {
        Self {
            cost: cost.clamp(MIN_COST, MAX_COST),
        }
    }

    #[must_use]
    pub const fn cost(&self) -> u32 {
        self.cost
    }

    /// Hash a password for storage.
    ///
    /// # Errors
    /// Returns `INTERNAL` when hashing produces no output.
    pub fn hash(&self, password: &str) -> ServiceResult<String> {
        Ok(bcrypt::hash(password, self.cost)?)
    }

    /// Verify a password against a stored hash.
    ///
    /// A mismatch is `Ok(false)`; only a malformed stored hash is an error.
    /// bcrypt comparison is constant-time with respect to the hash content.
    ///
    /// # Errors
    /// Returns `INTERNAL` when the stored hash cannot be parsed.
    pub fn verify(&self, password: &str, hash: &str) -> ServiceResult<bool> {
        Ok(bcrypt::verify(password, hash)?)
    }
}
