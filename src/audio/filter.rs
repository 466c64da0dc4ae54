//! In-process PCM filter seam for the transmit path.

/// A synchronous filter over interleaved 16-bit PCM samples.
///
/// Filters run synchronously in installation order; order is observable
/// (e.g. equalization before compression).
pub trait PcmFilter: Send {
    fn process(&mut self, samples: &mut [i16]);
}

impl<F> PcmFilter for F
where
    F: FnMut(&mut [i16]) + Send,
{
    fn process(&mut self, samples: &mut [i16]) {
        self(samples)
    }
}
