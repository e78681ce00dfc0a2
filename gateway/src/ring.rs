//! A small fixed-capacity ring buffer shared by the mirror engine's
//! mismatch store and latency samples (§4.9), grounded in the teacher's
//! hand-rolled `BufList` (a `VecDeque`-backed buffer) rather than pulling
//! in a histogram crate for two bounded collections.
//!
//! Capacity is fixed at construction (§3 "ring capacity is fixed at
//! construction"); `total()` keeps counting past capacity so a caller can
//! always answer "how many have I seen" even after wraparound (MIRROR-2).

use std::collections::VecDeque;
use std::sync::Mutex;

pub struct RingBuffer<T> {
	capacity: usize,
	items: Mutex<VecDeque<T>>,
	total: std::sync::atomic::AtomicU64,
}

impl<T> RingBuffer<T> {
	pub fn new(capacity: usize) -> Self {
		RingBuffer {
			capacity: capacity.max(1),
			items: Mutex::new(VecDeque::with_capacity(capacity)),
			total: std::sync::atomic::AtomicU64::new(0),
		}
	}

	pub fn push(&self, item: T) {
		let mut guard = self.items.lock().expect("ring buffer lock poisoned");
		if guard.len() == self.capacity {
			guard.pop_front();
		}
		guard.push_back(item);
		self.total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
	}

	/// Total items ever pushed, preserved across wraparound.
	pub fn total(&self) -> u64 {
		self.total.load(std::sync::atomic::Ordering::Relaxed)
	}

	pub fn len(&self) -> usize {
		self.items.lock().expect("ring buffer lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn clear(&self) {
		self.items.lock().expect("ring buffer lock poisoned").clear();
	}

	pub fn snapshot(&self) -> Vec<T>
	where
		T: Clone,
	{
		self
			.items
			.lock()
			.expect("ring buffer lock poisoned")
			.iter()
			.cloned()
			.collect()
	}
}

impl RingBuffer<u64> {
	/// p50/p95/p99 over the currently-held samples (e.g. latency in
	/// microseconds). Sorted copy, nearest-rank method; empty buffer
	/// yields zeros.
	pub fn percentiles(&self) -> Percentiles {
		let mut samples = self.snapshot();
		if samples.is_empty() {
			return Percentiles::default();
		}
		samples.sort_unstable();
		let at = |p: f64| -> u64 {
			let idx = ((samples.len() as f64 - 1.0) * p).round() as usize;
			samples[idx.min(samples.len() - 1)]
		};
		Percentiles {
			p50: at(0.50),
			p95: at(0.95),
			p99: at(0.99),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Percentiles {
	pub p50: u64,
	pub p95: u64,
	pub p99: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn total_survives_wraparound() {
		let ring: RingBuffer<u32> = RingBuffer::new(3);
		for i in 0..10 {
			ring.push(i);
		}
		assert_eq!(ring.len(), 3);
		assert_eq!(ring.total(), 10);
		assert_eq!(ring.snapshot(), vec![7, 8, 9]);
	}

	#[test]
	fn percentiles_over_samples() {
		let ring: RingBuffer<u64> = RingBuffer::new(100);
		for i in 1..=100u64 {
			ring.push(i);
		}
		let p = ring.percentiles();
		assert_eq!(p.p50, 50);
		assert_eq!(p.p99, 99);
	}
}
