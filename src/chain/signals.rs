//! Synchronous signal fanout.
//!
//! Subscribers run on the app thread, in connection order, at the
//! point the corresponding event committed. A subscriber returning an
//! error never unwinds into consensus code; the error is logged and
//! the remaining subscribers still run.

use tracing::warn;

pub struct Signal<T> {
  name: &'static str,
  slots: Vec<Box<dyn Fn(&T) -> anyhow::Result<()>>>,
}

impl<T> Signal<T> {
  pub fn new(name: &'static str) -> Self {
    Self { name, slots: Vec::new() }
  }

  pub fn connect(&mut self, slot: impl Fn(&T) -> anyhow::Result<()> + 'static) {
    self.slots.push(Box::new(slot));
  }

  pub fn emit(&self, payload: &T) {
    for slot in &self.slots {
      if let Err(error) = slot(payload) {
        warn!("subscriber of signal `{}` failed: {error:#}", self.name);
      }
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.slots.len()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    std::{cell::RefCell, rc::Rc},
  };

  #[test]
  fn emits_in_connection_order() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut signal = Signal::<u32>::new("test");

    let a = Rc::clone(&seen);
    signal.connect(move |v| {
      a.borrow_mut().push(("a", *v));
      Ok(())
    });
    let b = Rc::clone(&seen);
    signal.connect(move |v| {
      b.borrow_mut().push(("b", *v));
      Ok(())
    });

    signal.emit(&7);
    assert_eq!(*seen.borrow(), vec![("a", 7), ("b", 7)]);
  }

  #[test]
  fn failing_subscriber_does_not_stop_fanout() {
    let seen = Rc::new(RefCell::new(0));
    let mut signal = Signal::<()>::new("test");
    signal.connect(|_| anyhow::bail!("boom"));
    let counter = Rc::clone(&seen);
    signal.connect(move |_| {
      *counter.borrow_mut() += 1;
      Ok(())
    });

    signal.emit(&());
    assert_eq!(*seen.borrow(), 1);
  }
}
