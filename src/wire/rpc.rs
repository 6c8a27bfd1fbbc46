//! RPC records: a 1-byte call id followed by the serialized arguments.
//!
//! The send side pairs a call id with its argument signature at compile time
//! ([`Call`]); the receive side owns a 256-slot table of erased handlers
//! keyed by the id byte ([`CallRouter`]). Multiple records may be
//! concatenated in a single TCP frame or UDP datagram.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};

use crate::wire::ser::WireSerialize;
use crate::wire::stream::{StreamReader, StreamWriter};

pub type CallId = u8;

/// Argument tuples of a call signature. Implemented for tuples of up to five
/// [`WireSerialize`] values; the wire contract is independent of arity.
pub trait CallArgs: Sized + Send + 'static {
    fn ser_all(&self, w: &mut StreamWriter<'_>);
    fn try_deser_all(r: &mut StreamReader<'_>) -> anyhow::Result<Self>;
}

macro_rules! call_args_tuple {
    ($($name:ident : $idx:tt),*) => {
        impl<$($name: WireSerialize + Send + 'static),*> CallArgs for ($($name,)*) {
            fn ser_all(&self, _w: &mut StreamWriter<'_>) {
                $(self.$idx.ser(_w);)*
            }

            fn try_deser_all(_r: &mut StreamReader<'_>) -> anyhow::Result<Self> {
                Ok(($($name::try_deser(_r)?,)*))
            }
        }
    };
}

call_args_tuple!();
call_args_tuple!(A: 0);
call_args_tuple!(A: 0, B: 1);
call_args_tuple!(A: 0, B: 1, C: 2);
call_args_tuple!(A: 0, B: 1, C: 2, D: 3);
call_args_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);

/// A compile-time pairing of a call id with its argument signature.
pub struct Call<A> {
    id: CallId,
    _args: PhantomData<fn(A)>,
}

impl<A> Clone for Call<A> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<A> Copy for Call<A> {}

impl<A: CallArgs> Call<A> {
    pub const fn new(id: CallId) -> Call<A> {
        Call {
            id,
            _args: PhantomData,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    /// Encodes `{id, args}` into `out`. A record that does not fit is
    /// refused; nothing is written to the transport in that case.
    pub fn encode(&self, args: &A, out: &mut [u8]) -> anyhow::Result<usize> {
        let mut w = StreamWriter::fixed(out);
        self.id.ser(&mut w);
        args.ser_all(&mut w);
        if !w.good() {
            bail!(
                "arguments of call {} exceed the {} byte record limit",
                self.id,
                out.len()
            );
        }
        Ok(w.used())
    }
}

type ErasedHandler = Arc<dyn Fn(&mut StreamReader<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Outcome of [`CallRouter::dispatch_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// The stream ended exactly on a record boundary.
    EndOfStream,
}

/// Runtime dispatch table: one slot per call id.
///
/// The table lock is not held while a handler runs, so handlers may register
/// or clear other calls.
pub struct CallRouter {
    table: Mutex<[Option<ErasedHandler>; 256]>,
}

impl Default for CallRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRouter {
    pub fn new() -> CallRouter {
        CallRouter {
            table: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    pub fn set<A: CallArgs>(&self, call: Call<A>, handler: impl Fn(A) + Send + Sync + 'static) {
        let erased: ErasedHandler = Arc::new(move |r: &mut StreamReader<'_>| {
            let args = A::try_deser_all(r)?;
            handler(args);
            Ok(())
        });
        self.table.lock().unwrap()[call.id() as usize] = Some(erased);
    }

    pub fn clear(&self, id: CallId) {
        self.table.lock().unwrap()[id as usize] = None;
    }

    pub fn clear_all(&self) {
        let mut table = self.table.lock().unwrap();
        for slot in table.iter_mut() {
            *slot = None;
        }
    }

    /// Decodes and invokes the next record on the stream.
    ///
    /// An unknown call id or a record whose arguments cannot be decoded is a
    /// protocol violation and comes back as an error; the caller is expected
    /// to discard the rest of the frame and disconnect the peer.
    pub fn dispatch_one(&self, r: &mut StreamReader<'_>) -> anyhow::Result<Dispatch> {
        if r.remaining() == 0 {
            return Ok(Dispatch::EndOfStream);
        }
        let id = u8::try_deser(r)?;
        let handler = self.table.lock().unwrap()[id as usize].clone();
        let handler = handler.ok_or_else(|| anyhow!("no handler registered for call id {}", id))?;
        handler(r)?;
        Ok(Dispatch::Handled)
    }
}
