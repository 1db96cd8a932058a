use std::cell::RefCell;
use std::rc::Rc;

use super::events::Event;

/// Trait implemented by owners that wish to observe shutdown progress events.
pub trait Reporter {
    /// Receive a structured event.
    fn report(&mut self, event: Event);
}

impl Reporter for () {
    fn report(&mut self, _event: Event) {}
}

impl Reporter for Vec<Event> {
    fn report(&mut self, event: Event) {
        self.push(event);
    }
}

impl<R: Reporter + ?Sized> Reporter for Rc<RefCell<R>> {
    fn report(&mut self, event: Event) {
        self.borrow_mut().report(event);
    }
}
