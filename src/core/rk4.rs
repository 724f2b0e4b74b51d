//! Fixed-step classic Runge-Kutta (RK4) integration.
//!
//! The state is a fixed-size array so every stage buffer lives on the stack of
//! the call, and the advanced state is returned by value. The output therefore
//! can never alias the input `y0`: the distinct-buffer precondition of an
//! in-place RK4 is carried by the signature instead of by caller discipline.

/// Advance `y0` by one step of size `h`.
///
/// `dydt0` must be the derivative already evaluated at `y0`; it is reused as
/// the first stage, so `f` is called exactly three times.
///
/// `y = y0 + h/6 * (k1 + 2*k2 + 2*k3 + k4)` with
/// `k1 = dydt0`, `k2 = f(y0 + h/2*k1)`, `k3 = f(y0 + h/2*k2)`, `k4 = f(y0 + h*k3)`.
#[inline]
pub fn rk4_step<const N: usize, F>(y0: &[f64; N], dydt0: &[f64; N], h: f64, mut f: F) -> [f64; N]
where
    F: FnMut(&[f64; N]) -> [f64; N],
{
    let h2 = h / 2.0;
    let h6 = h / 6.0;

    let mut probe = [0.0; N];

    // k1 -> k2
    for i in 0..N {
        probe[i] = y0[i] + h2 * dydt0[i];
    }
    let k2 = f(&probe);

    // k2 -> k3
    for i in 0..N {
        probe[i] = y0[i] + h2 * k2[i];
    }
    let k3 = f(&probe);

    // k3 -> k4
    for i in 0..N {
        probe[i] = y0[i] + h * k3[i];
    }
    let k4 = f(&probe);

    let mut y = [0.0; N];
    for i in 0..N {
        y[i] = y0[i] + h6 * (dydt0[i] + k4[i] + 2.0 * (k2[i] + k3[i]));
    }
    y
}
