//! Reverse-mode tape protocol.
//!
//! There is no global graph. Each tensor may carry a [`Producer`]: the id of
//! the operation that created it plus a weak handle to that operation. When a
//! backward pass reaches a tensor whose gradient must travel further than the
//! current layer, the gradient is written into the tensor and the producer's
//! [`DifferentiableOp::backward`] is invoked through the weak handle. A tensor
//! never keeps its producer alive.

use crate::{
    error::{Result, TensorustError},
    tensor::Tensor,
};
use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};
use uuid::Uuid;

/// Weak handle to an operation that can receive gradients.
pub type OpHandle<T> = Weak<RefCell<dyn DifferentiableOp<T>>>;

/// Capability implemented by every operation that produces tensors.
pub trait DifferentiableOp<T> {
    /// Identity used to tag produced tensors.
    fn op_id(&self) -> Uuid;

    /// Consumes the gradient stored in `output.grad()` for one tensor this
    /// operation produced, and continues the chain into its own inputs.
    fn backward(&mut self, output: &Tensor<T>) -> Result<()>;

    /// Receives the handle other tensors use to dispatch back into this op.
    fn attach(&mut self, _handle: OpHandle<T>) {}
}

/// Back-reference from a tensor to the operation that created it.
pub struct Producer<T> {
    id: Uuid,
    op: Option<OpHandle<T>>,
}

impl<T> Producer<T> {
    /// A producer that can be recognised by id but not dispatched to.
    pub fn detached(id: Uuid) -> Self {
        Self { id, op: None }
    }

    pub fn new(id: Uuid, op: Option<OpHandle<T>>) -> Self {
        Self { id, op }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the producing operation can still be reached.
    pub fn is_alive(&self) -> bool {
        self.op
            .as_ref()
            .map_or(false, |op| op.strong_count() > 0)
    }

    /// Invokes the producer's backward with `output`.
    ///
    /// Returns `Ok(false)` when the producer has no handle or has been
    /// dropped; the gradient chain simply ends there.
    ///
    /// # Errors
    ///
    /// Returns [`TensorustError::ProducerBusy`] if the producer is already
    /// mutably borrowed further up the call stack, or whatever its backward
    /// returns.
    pub fn dispatch(&self, output: &Tensor<T>) -> Result<bool> {
        let Some(op) = self.op.as_ref().and_then(Weak::upgrade) else {
            log::warn!("producer {} is gone; gradient chain ends here", self.id);
            return Ok(false);
        };
        let mut op = op.try_borrow_mut().map_err(|_| TensorustError::ProducerBusy)?;
        op.backward(output)?;
        Ok(true)
    }
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            op: self.op.clone(),
        }
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Wraps an operation so tensors it produces can dispatch back into it.
pub fn shared<T, O>(op: O) -> Rc<RefCell<O>>
where
    T: 'static,
    O: DifferentiableOp<T> + 'static,
{
    Rc::new_cyclic(|me: &Weak<RefCell<O>>| {
        let mut op = op;
        let handle: OpHandle<T> = me.clone();
        op.attach(handle);
        RefCell::new(op)
    })
}
