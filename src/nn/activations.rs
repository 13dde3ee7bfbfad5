//! Elementwise gate activations.
//!
//! The derivatives take the already-activated value `y` rather than the raw
//! input, so backward passes only need what forward cached.

use crate::tensor::Scalar;

/// Logistic sigmoid, `1 / (1 + e^-x)`.
#[inline]
pub fn sigmoid<T: Scalar>(x: T) -> T {
    T::one() / (T::one() + (-x).exp())
}

#[inline]
pub fn tanh<T: Scalar>(x: T) -> T {
    x.tanh()
}

/// Derivative of the sigmoid given its output `y = sigmoid(x)`.
#[inline]
pub fn sigmoid_grad<T: Scalar>(y: T) -> T {
    y * (T::one() - y)
}

/// Derivative of tanh given its output `y = tanh(x)`.
#[inline]
pub fn tanh_grad<T: Scalar>(y: T) -> T {
    T::one() - y * y
}
