//! Registration of selectable resources with a loop's notifier.
//!
//! A registration binds one resource to one loop for life. Its interest
//! mask, attachment, and cancel flag are only ever touched on the owning
//! loop's thread; foreign callers funnel mutations through the loop's
//! task queue via the [`Registration`] handle.

use std::any::Any;
use std::io;

use mio::{Interest, Registry, Token};

use crate::error::{Error, Result};
use crate::ops::Ops;
use crate::reactor::EventLoop;

/// Notifier-facing operations every registered resource supports.
pub trait SourceIo: Send {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;
    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
    /// The operations this kind of resource can ever be interested in.
    fn valid_ops(&self) -> Ops;
}

/// A user-registrable resource. `as_any_mut` lets readiness tasks recover
/// the concrete socket type they registered.
pub trait Selectable: SourceIo + Any {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

macro_rules! impl_selectable {
    ($ty:ty, $ops:expr) => {
        impl SourceIo for $ty {
            fn register(
                &mut self,
                registry: &Registry,
                token: Token,
                interest: Interest,
            ) -> io::Result<()> {
                registry.register(self, token, interest)
            }

            fn reregister(
                &mut self,
                registry: &Registry,
                token: Token,
                interest: Interest,
            ) -> io::Result<()> {
                registry.reregister(self, token, interest)
            }

            fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
                registry.deregister(self)
            }

            fn valid_ops(&self) -> Ops {
                $ops
            }
        }

        impl Selectable for $ty {
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }
    };
}

impl_selectable!(mio::net::TcpListener, Ops::ACCEPT);
impl_selectable!(mio::net::TcpStream, Ops::READ.or(Ops::WRITE).or(Ops::CONNECT));
impl_selectable!(mio::net::UdpSocket, Ops::READ.or(Ops::WRITE));

/// The internal channel face the dispatch loop drives. Implementations
/// own their socket and surface it through [`SourceIo`].
pub trait ChannelIo: SourceIo {
    /// Completes an in-flight connect. Called with the connect bit
    /// already cleared from the interest mask.
    fn finish_connect(&mut self) -> io::Result<()>;
    /// Writable: push out whatever is queued.
    fn force_flush(&mut self);
    /// Readable or acceptable; also invoked for zero-ready entries as a
    /// defense against notifiers that report nothing.
    fn read_ready(&mut self) -> io::Result<()>;
    /// Identity of the loop this channel believes it is registered to.
    fn loop_id(&self) -> Option<u64>;
    fn is_open(&self) -> bool;
    fn close(&mut self);
}

/// A user readiness callback, the non-channel attachment kind.
pub trait ReadyTask: Send {
    /// Invoked on the loop thread whenever the registered resource is
    /// ready. Errors cancel the registration and fire
    /// [`channel_unregistered`](Self::channel_unregistered) with the
    /// cause.
    fn channel_ready(
        &mut self,
        source: &mut dyn Selectable,
        ctx: &mut ReadyContext<'_>,
    ) -> Result<()>;

    /// Invoked once the registration is gone, with the failure cause if
    /// one triggered it.
    fn channel_unregistered(&mut self, _source: &mut dyn Selectable, _cause: Option<&Error>) {}
}

/// What a readiness task sees and may change during one dispatch.
/// Interest changes and cancellation are applied by the loop after the
/// callback returns.
pub struct ReadyContext<'a> {
    pub(crate) ready: Ops,
    pub(crate) interest: Ops,
    pub(crate) new_interest: &'a mut Option<Ops>,
    pub(crate) cancelled: &'a mut bool,
}

impl ReadyContext<'_> {
    /// The ready operations, already masked with the interest set.
    pub fn ready_ops(&self) -> Ops {
        self.ready
    }

    pub fn interest_ops(&self) -> Ops {
        self.interest
    }

    /// Replaces the interest mask, effective before the next blocking
    /// wait on the notifier.
    pub fn set_interest_ops(&mut self, ops: Ops) -> Result<()> {
        if ops.is_empty() {
            return Err(Error::InvalidArgument("interest ops must be non-zero".into()));
        }
        *self.new_interest = Some(ops);
        Ok(())
    }

    /// Cancels this registration after the callback returns.
    pub fn cancel(&mut self) {
        *self.cancelled = true;
    }
}

/// What one notifier slot carries: a channel driven by the loop itself,
/// or a user callback with its resource.
pub(crate) enum Attachment {
    Channel(Box<dyn ChannelIo>),
    Task {
        source: Box<dyn Selectable>,
        task: Box<dyn ReadyTask>,
    },
}

impl Attachment {
    pub fn valid_ops(&self) -> Ops {
        match self {
            Attachment::Channel(ch) => ch.valid_ops(),
            Attachment::Task { source, .. } => source.valid_ops(),
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token, ops: Ops) -> io::Result<()> {
        let interest = interest_of(ops)?;
        match self {
            Attachment::Channel(ch) => ch.register(registry, token, interest),
            Attachment::Task { source, .. } => source.register(registry, token, interest),
        }
    }

    pub fn reregister(&mut self, registry: &Registry, token: Token, ops: Ops) -> io::Result<()> {
        let interest = interest_of(ops)?;
        match self {
            Attachment::Channel(ch) => ch.reregister(registry, token, interest),
            Attachment::Task { source, .. } => source.reregister(registry, token, interest),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Attachment::Channel(ch) => ch.deregister(registry),
            Attachment::Task { source, .. } => source.deregister(registry),
        }
    }
}

fn interest_of(ops: Ops) -> io::Result<Interest> {
    ops.to_interest()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty interest"))
}

/// One slot in the loop's registration table.
pub(crate) struct Entry {
    pub interest: Ops,
    /// Checked out while its readiness is being dispatched.
    pub attachment: Option<Attachment>,
    pub cancelled: bool,
}

/// Caller-side handle to a registration. All operations funnel onto the
/// owning loop's thread.
pub struct Registration {
    pub(crate) event_loop: EventLoop,
    pub(crate) token: usize,
}

impl Registration {
    pub fn token(&self) -> usize {
        self.token
    }

    /// Replaces the interest mask. The notifier observes the change on
    /// or before its next blocking wait.
    pub fn set_interest_ops(&self, ops: Ops) -> Result<()> {
        self.event_loop.set_interest_ops(self.token, ops)
    }

    pub fn interest_ops(&self) -> Result<Ops> {
        self.event_loop.interest_ops(self.token)
    }

    /// Cancels the registration. The slot is reclaimed by the loop; the
    /// resource itself is not closed.
    pub fn cancel(&self) -> Result<()> {
        self.event_loop.cancel_registration(self.token)
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("token", &self.token)
            .finish()
    }
}
