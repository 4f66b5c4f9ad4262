use crate::{Error, ValueStruct};

/// A uni-directional cursor over internal keys.
///
/// An iterator is created either ascending or descending and keeps that
/// direction for its lifetime. `seek` positions at the first key `>= key`
/// when ascending and at the first key `<= key` when descending; `rewind`
/// positions at the first key in iteration order.
pub trait KvIterator {
    fn next(&mut self);
    fn rewind(&mut self);
    fn seek(&mut self, key: &[u8]);
    /// Internal key at the current position. Only meaningful while `valid()`.
    fn key(&self) -> &[u8];
    /// Value cell at the current position, with `version` filled in.
    fn value(&self) -> ValueStruct;
    fn valid(&self) -> bool;

    /// Takes the first error that stopped iteration. An iterator that hits
    /// an error becomes invalid.
    fn take_error(&mut self) -> Option<Error> {
        None
    }
}

impl<T: KvIterator + ?Sized> KvIterator for Box<T> {
    fn next(&mut self) {
        (**self).next()
    }

    fn rewind(&mut self) {
        (**self).rewind()
    }

    fn seek(&mut self, key: &[u8]) {
        (**self).seek(key)
    }

    fn key(&self) -> &[u8] {
        (**self).key()
    }

    fn value(&self) -> ValueStruct {
        (**self).value()
    }

    fn valid(&self) -> bool {
        (**self).valid()
    }

    fn take_error(&mut self) -> Option<Error> {
        (**self).take_error()
    }
}
