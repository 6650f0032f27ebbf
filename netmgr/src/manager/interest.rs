/// Readiness interest / readiness event flags.
///
/// Used both for what a descriptor wants to hear about and for what a
/// backend reports. `HANGUP` is only ever reported, never registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
  bits: u8,
}

impl Interest {
  pub const NONE: Self = Self { bits: 0 };
  pub const READ: Self = Self { bits: 1 << 0 };
  pub const WRITE: Self = Self { bits: 1 << 1 };
  pub const EXCEPTION: Self = Self { bits: 1 << 2 };
  pub const HANGUP: Self = Self { bits: 1 << 3 };
  pub const READ_AND_WRITE: Self =
    Self { bits: Self::READ.bits | Self::WRITE.bits };

  pub const fn is_readable(self) -> bool {
    self.bits & Self::READ.bits != 0
  }

  pub const fn is_writable(self) -> bool {
    self.bits & Self::WRITE.bits != 0
  }

  pub const fn is_exceptional(self) -> bool {
    self.bits & Self::EXCEPTION.bits != 0
  }

  pub const fn is_hangup(self) -> bool {
    self.bits & Self::HANGUP.bits != 0
  }

  pub const fn is_none(self) -> bool {
    self.bits == 0
  }

  /// Combine interests using bitwise OR
  pub const fn or(self, other: Self) -> Self {
    Self { bits: self.bits | other.bits }
  }

  /// Clear every bit present in `other`
  pub const fn without(self, other: Self) -> Self {
    Self { bits: self.bits & !other.bits }
  }

  /// Keep only the bits also present in `other`
  pub const fn and(self, other: Self) -> Self {
    Self { bits: self.bits & other.bits }
  }

  /// Check if this interest contains all bits from another
  pub const fn contains(self, other: Self) -> bool {
    (self.bits & other.bits) == other.bits
  }
}

impl std::ops::BitOr for Interest {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self::Output {
    self.or(rhs)
  }
}

impl std::ops::BitOrAssign for Interest {
  fn bitor_assign(&mut self, rhs: Self) {
    *self = self.or(rhs);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn combine_and_clear() {
    let mut interest = Interest::READ;
    interest |= Interest::EXCEPTION;
    assert!(interest.is_readable());
    assert!(interest.is_exceptional());
    assert!(!interest.is_writable());

    let interest = interest.without(Interest::READ);
    assert_eq!(interest, Interest::EXCEPTION);
    assert!(interest.without(Interest::EXCEPTION).is_none());
  }

  #[test]
  fn contains_and_mask() {
    assert!(Interest::READ_AND_WRITE.contains(Interest::WRITE));
    assert!(!Interest::READ.contains(Interest::READ_AND_WRITE));
    assert_eq!(
      (Interest::READ | Interest::HANGUP).and(Interest::READ_AND_WRITE),
      Interest::READ
    );
  }
}
