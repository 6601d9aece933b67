//! Definition of counters, used for retry attempts, and message IDs.

/// Errors that can occur when incrementing a counter.
#[non_exhaustive]
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The counter exceeded its maximum value and wrapped to zero.
    Overrun,
}

/// A bounded counter that wraps at its maximum value.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Counter {
    value: u8,
    max_value: u8,
}

/// The counters defined by the governing specification.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterType {
    /// Busy responses tolerated before giving up.
    Busy,
    /// Source capability transmissions without a response.
    Caps,
    /// Discover Identity attempts towards a cable plug.
    DiscoverIdentity,
    /// Hard resets issued before declaring the partner unresponsive.
    HardReset,
    /// The per-endpoint rolling message ID.
    MessageId,
    /// Transmission retries for a single message.
    Retry,
}

impl Counter {
    /// Create a counter of the given type, starting at zero.
    pub fn new(counter_type: CounterType) -> Self {
        // See spec, [Table 6.70]
        let max_value = match counter_type {
            CounterType::Busy => 5,
            CounterType::Caps => 50,
            CounterType::DiscoverIdentity => 20,
            CounterType::HardReset => 3,
            CounterType::MessageId => 7,
            CounterType::Retry => 2,
        };

        Self { value: 0, max_value }
    }

    /// Create a counter of the given type with an initial value.
    pub fn new_from_value(counter_type: CounterType, value: u8) -> Self {
        let mut counter = Self::new(counter_type);
        counter.set(value);
        counter
    }

    /// Set the counter value, wrapping at the maximum.
    pub fn set(&mut self, value: u8) {
        self.value = value % (self.max_value + 1);
    }

    /// The current counter value.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Increment the counter, reporting an overrun when it wraps.
    pub fn increment(&mut self) -> Result<(), Error> {
        self.set(self.value + 1);

        if self.value == 0 {
            Err(Error::Overrun)
        } else {
            Ok(())
        }
    }

    /// Reset the counter to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_wraps_modulo_eight() {
        let mut counter = Counter::new(CounterType::MessageId);

        for expected in 1..=7 {
            counter.increment().unwrap();
            assert_eq!(counter.value(), expected);
        }

        // The eighth increment wraps back to zero and reports the overrun.
        assert!(counter.increment().is_err());
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn hard_reset_counter_allows_three_attempts() {
        let mut counter = Counter::new(CounterType::HardReset);

        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_err());
    }
}
