//! Pipes: bounded byte streams between threads.
//!
//! A fixed-size ring buffer plus a read signaler. Readers that find the
//! pipe empty sleep on the signaler; every write wakes them. A wait on a
//! pipe that already holds data finishes without blocking.

use alloc::string::String;
use alloc::sync::{Arc, Weak};

use spin::Mutex;

use crate::error::Errno;
use crate::fs::FileDescriptor;
use crate::sync::{Condition, ConditionWaiter, Signaler};
use crate::task::scheduler::Scheduler;

/// Size of each pipe's internal buffer (4 KiB).
pub const PIPE_BUF_SIZE: usize = 4096;

struct Ring {
	buf: [u8; PIPE_BUF_SIZE],
	read_pos: usize,
	write_pos: usize,
	count: usize,
}

impl Ring {
	const fn new() -> Self {
		Self {
			buf: [0; PIPE_BUF_SIZE],
			read_pos: 0,
			write_pos: 0,
			count: 0,
		}
	}

	/// Returns the number of bytes written (short if the buffer fills up).
	fn write(&mut self, data: &[u8]) -> usize {
		let mut written = 0;
		for &byte in data {
			if self.count >= PIPE_BUF_SIZE {
				break;
			}
			self.buf[self.write_pos] = byte;
			self.write_pos = (self.write_pos + 1) % PIPE_BUF_SIZE;
			self.count += 1;
			written += 1;
		}
		written
	}

	fn read(&mut self, buf: &mut [u8]) -> usize {
		let mut nread = 0;
		for slot in buf.iter_mut() {
			if self.count == 0 {
				break;
			}
			*slot = self.buf[self.read_pos];
			self.read_pos = (self.read_pos + 1) % PIPE_BUF_SIZE;
			self.count -= 1;
			nread += 1;
		}
		nread
	}
}

pub struct Pipe {
	name: String,
	ring: Mutex<Ring>,
	readable: Arc<Signaler>,
}

impl Pipe {
	pub fn new(name: &str) -> Arc<Self> {
		Arc::new_cyclic(|me: &Weak<Pipe>| {
			let readable = Signaler::new();
			let pipe = me.clone();
			readable.set_already_satisfied_function(move |_| {
				pipe.upgrade().is_some_and(|p| p.available() > 0)
			});
			Self {
				name: String::from(name),
				ring: Mutex::new(Ring::new()),
				readable,
			}
		})
	}

	/// Bytes buffered and not read yet.
	pub fn available(&self) -> usize {
		self.ring.lock().count
	}

	/// Signaled whenever data is written.
	pub fn readable(&self) -> &Arc<Signaler> {
		&self.readable
	}

	/// Buffer `data` and wake sleeping readers. Returns bytes written.
	pub fn write(&self, data: &[u8]) -> usize {
		let written = self.ring.lock().write(data);
		if written > 0 {
			self.readable.broadcast();
		}
		written
	}

	/// Read what is there, without waiting.
	pub fn try_read(&self, buf: &mut [u8]) -> usize {
		self.ring.lock().read(buf)
	}

	/// Read at least one byte, sleeping until a writer provides some.
	pub fn read_blocking(&self, buf: &mut [u8], scheduler: &dyn Scheduler) -> usize {
		if buf.is_empty() {
			return 0;
		}
		loop {
			let nread = self.try_read(buf);
			if nread > 0 {
				return nread;
			}
			let mut waiter = ConditionWaiter::new();
			waiter.add_condition(Condition::new(&self.readable));
			waiter.wait(scheduler);
			waiter.finish();
		}
	}
}

impl FileDescriptor for Pipe {
	fn name(&self) -> &str {
		&self.name
	}

	/// Pipes have no offsets; this is a non-blocking read.
	fn read(&self, _offset: usize, buf: &mut [u8]) -> Result<usize, Errno> {
		Ok(self.try_read(buf))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::task::RoundRobin;
	use crate::task::thread::Thread;
	use alloc::vec;

	#[test]
	fn test_ring_wraps_and_fills() {
		let pipe = Pipe::new("p");
		let big = vec![7u8; PIPE_BUF_SIZE + 10];
		assert_eq!(pipe.write(&big), PIPE_BUF_SIZE);
		assert_eq!(pipe.write(b"x"), 0);

		let mut out = [0u8; 100];
		assert_eq!(pipe.try_read(&mut out), 100);
		assert_eq!(pipe.write(b"abc"), 3);
		assert_eq!(pipe.available(), PIPE_BUF_SIZE - 97);
	}

	#[test]
	fn test_wait_on_buffered_pipe_does_not_block() {
		let rr = Arc::new(RoundRobin::new());
		let scheduler: Arc<dyn Scheduler> = rr.clone();
		let reader = Thread::kernel(1, &scheduler);
		rr.set_current(&reader);

		let pipe = Pipe::new("p");
		pipe.write(b"hi");
		let mut buf = [0u8; 8];
		// Nothing else is runnable: blocking here would panic with a deadlock.
		assert_eq!(pipe.read_blocking(&mut buf, scheduler.as_ref()), 2);
		assert_eq!(&buf[..2], b"hi");
		assert_eq!(pipe.readable().subscriber_count(), 0);
	}

	#[test]
	fn test_reader_sleeps_until_write() {
		let rr = Arc::new(RoundRobin::new());
		let scheduler: Arc<dyn Scheduler> = rr.clone();
		let pipe = Pipe::new("p");
		let got = Arc::new(Mutex::new(alloc::vec::Vec::new()));

		let reader = Thread::kernel(1, &scheduler);
		let (p, s, g) = (pipe.clone(), scheduler.clone(), got.clone());
		rr.spawn(&reader, move || {
			let mut buf = [0u8; 16];
			let n = p.read_blocking(&mut buf, s.as_ref());
			g.lock().extend_from_slice(&buf[..n]);
		});

		let writer = Thread::kernel(2, &scheduler);
		let p = pipe.clone();
		rr.spawn(&writer, move || {
			assert_eq!(p.readable().subscriber_count(), 1);
			p.write(b"ping");
		});

		rr.run();
		assert_eq!(&got.lock()[..], b"ping");
	}

	#[test]
	fn test_readers_chained_through_pipes() {
		let rr = Arc::new(RoundRobin::new());
		let scheduler: Arc<dyn Scheduler> = rr.clone();
		let (first, second) = (Pipe::new("first"), Pipe::new("second"));
		let got = Arc::new(Mutex::new(alloc::vec::Vec::new()));

		// Forwards from the first pipe into the second.
		let relay = Thread::kernel(1, &scheduler);
		let (p1, p2, s) = (first.clone(), second.clone(), scheduler.clone());
		rr.spawn(&relay, move || {
			let mut buf = [0u8; 16];
			let n = p1.read_blocking(&mut buf, s.as_ref());
			p2.write(&buf[..n]);
		});

		let reader = Thread::kernel(2, &scheduler);
		let (p2, s, g) = (second.clone(), scheduler.clone(), got.clone());
		rr.spawn(&reader, move || {
			let mut buf = [0u8; 16];
			let n = p2.read_blocking(&mut buf, s.as_ref());
			g.lock().extend_from_slice(&buf[..n]);
		});

		// Wakes the relay, which blocked before the reader did.
		let writer = Thread::kernel(3, &scheduler);
		let p1 = first.clone();
		rr.spawn(&writer, move || {
			p1.write(b"relayed");
		});

		rr.run();
		assert_eq!(&got.lock()[..], b"relayed");
		assert_eq!(rr.pending_tasks(), 0);
		assert_eq!(first.available(), 0);
		assert_eq!(second.available(), 0);
	}
}
