//! Scalar values which form a computation graph
use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    fmt::{self, Debug, Display},
    iter::Sum,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
};

use rand::Rng;

use crate::backprop_fns::{self, BackpropFunc};

type SharedValue = Rc<RefCell<InnerValue>>;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Returns whether new operations are currently recorded in the graph
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

/// Restores the previous recording state when dropped, also on unwind
struct GradModeGuard {
    previous: bool,
}

impl GradModeGuard {
    fn set(enabled: bool) -> Self {
        let previous = GRAD_ENABLED.with(|g| g.replace(enabled));
        Self { previous }
    }
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|g| g.set(self.previous));
    }
}

/// Runs `f` with graph recording disabled. Values created inside are constants.
/// Analogous to `torch.no_grad()`
pub fn no_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = GradModeGuard::set(false);
    f()
}

/// Runs `f` with graph recording enabled, even inside a `no_grad` scope
pub fn enable_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = GradModeGuard::set(true);
    f()
}

/// Newtype representing a shared value in a computation graph
#[derive(Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a new constant, not derived from any other values and not tracked
    pub fn new(data: f32) -> Self {
        Self::leaf(data, false)
    }

    /// Create a new leaf which accumulates gradients on `backward`
    pub fn variable(data: f32) -> Self {
        Self::leaf(data, true)
    }

    pub fn leaf(data: f32, requires_grad: bool) -> Self {
        let mut inner = InnerValue::new(data, None);
        inner.requires_grad = requires_grad;
        Self(Rc::new(RefCell::new(inner)))
    }

    /// Create a new value derived from an operation on `operands` (i.e. not a leaf node).
    /// The operands are only recorded when the result takes part in differentiation.
    fn new_derived(data: f32, backprop_fn: BackpropFunc, operands: &[&Value]) -> Self {
        debug_assert_eq!(backprop_fn.n_operands(), operands.len());
        let requires_grad = is_grad_enabled() && operands.iter().any(|v| v.requires_grad());
        if !requires_grad {
            return Self::new(data);
        }
        let mut inner = InnerValue::new(data, Some(backprop_fn));
        inner.requires_grad = true;
        inner.children = operands.iter().map(|v| v.0.clone()).collect();
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    /// Accumulated gradient, `None` until a backward pass reaches this leaf
    pub fn grad(&self) -> Option<f32> {
        self.0.borrow().grad
    }

    pub fn id(&self) -> u64 {
        self.0.borrow().id
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    /// Leaves have no backprop function
    pub fn is_leaf(&self) -> bool {
        self.0.borrow().backprop_fn.is_none()
    }

    pub(crate) fn backprop_fn(&self) -> Option<BackpropFunc> {
        self.0.borrow().backprop_fn
    }

    pub(crate) fn children(&self) -> Vec<Value> {
        self.0.borrow().children.iter().cloned().map(Value).collect()
    }

    /// Toggles gradient tracking of a leaf. Returns `false` (and changes nothing)
    /// for a derived value, whose flag follows from its operands.
    pub fn set_requires_grad(&self, requires_grad: bool) -> bool {
        if !self.is_leaf() {
            return false;
        }
        self.0.borrow_mut().requires_grad = requires_grad;
        true
    }

    // Strictly, &mut isn't needed since the value is behind a shared mutable type,
    // but it indicates that the value should be excusively mutable
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    pub(crate) fn accumulate_grad(&self, grad: f32) {
        let mut inner = self.0.borrow_mut();
        inner.grad = Some(inner.grad.unwrap_or(0.0) + grad);
    }

    /// Resets the gradient accumulator of this value. Intermediate adjoints are never stored,
    /// so there is nothing else in the graph to clear
    pub fn zero_grad(&mut self) {
        self.0.borrow_mut().grad = None;
    }

    /// A new constant with the same data and no link to this value
    pub fn detach(&self) -> Value {
        Value::new(self.data())
    }

    /// Accumulates d self / d leaf into every reachable leaf that requires grad.
    /// The graph is kept, so backward may be called again (e.g. after an adaptation step).
    pub fn backward(&self) {
        if !self.requires_grad() {
            log::warn!("backward called on a value that does not require grad");
            return;
        }
        let (order, adjoints) = no_grad(|| propagate(self, Value::new(1.0), None));
        let mut n_leaves = 0;
        for value in order.iter().filter(|v| v.is_leaf()) {
            if let Some(adjoint) = adjoints.get(&value.id()) {
                value.accumulate_grad(adjoint.data());
                n_leaves += 1;
            }
        }
        log::trace!(
            "backward visited {} nodes, {} leaves",
            order.len(),
            n_leaves
        );
    }
}

/// Visits every node reachable from `root` which requires grad, children before parents
pub(crate) fn topological_order(root: &Value) -> Vec<Value> {
    let mut order = vec![];
    let mut visited: HashSet<u64> = HashSet::new();
    // (node, whether its children have already been pushed)
    let mut stack = vec![(root.clone(), false)];
    while let Some((value, expanded)) = stack.pop() {
        if expanded {
            order.push(value);
            continue;
        }
        // a node may be pushed from several parents, only the first pop expands it
        if !visited.insert(value.id()) {
            continue;
        }
        let children = value.children();
        stack.push((value, true));
        for child in children.into_iter().rev() {
            if child.requires_grad() && !visited.contains(&child.id()) {
                stack.push((child, false));
            }
        }
    }
    order
}

/// Reverse-mode pass from `root` with seed adjoint `seed`.
///
/// Returns the visit order together with the adjoint of every node which received one. When
/// `targets` is given, adjoints only flow into nodes which lie on a path to one of the targets.
/// The adjoints are built from [`Value`] operations, so running this with recording enabled
/// yields gradients which can be differentiated again.
pub(crate) fn propagate(
    root: &Value,
    seed: Value,
    targets: Option<&HashSet<u64>>,
) -> (Vec<Value>, HashMap<u64, Value>) {
    let order = topological_order(root);

    let needed: Option<HashSet<u64>> = targets.map(|targets| {
        let mut needed = HashSet::new();
        for value in order.iter() {
            let reaches = targets.contains(&value.id())
                || value.children().iter().any(|c| needed.contains(&c.id()));
            if reaches {
                needed.insert(value.id());
            }
        }
        needed
    });

    let mut adjoints: HashMap<u64, Value> = HashMap::new();
    adjoints.insert(root.id(), seed);

    // apply backprop, reversed to start from root first
    for value in order.iter().rev() {
        let Some(backprop_fn) = value.backprop_fn() else {
            continue;
        };
        let Some(grad) = adjoints.get(&value.id()).cloned() else {
            continue;
        };
        let children = value.children();
        debug_assert!(backprop_fn.n_operands() == children.len());
        let wanted = children
            .iter()
            .map(|c| {
                c.requires_grad()
                    && needed
                        .as_ref()
                        .is_none_or(|needed| needed.contains(&c.id()))
            })
            .collect::<Vec<_>>();
        let contributions =
            backprop_fns::vector_jacobian(backprop_fn, &children, value, &grad, &wanted);
        for (child, contribution) in children.iter().zip(contributions) {
            let Some(contribution) = contribution else {
                continue;
            };
            let id = child.id();
            let total = match adjoints.remove(&id) {
                Some(acc) => &acc + &contribution,
                None => contribution,
            };
            adjoints.insert(id, total);
        }
    }

    (order, adjoints)
}

// Various operations on values
impl Value {
    /// `self^other`, the exponent is treated as a constant when differentiating
    pub fn pow(&self, other: &Value) -> Value {
        Value::new_derived(
            self.data().powf(other.data()),
            BackpropFunc::Pow,
            &[self, other],
        )
    }

    pub fn powf(&self, exponent: f32) -> Value {
        self.pow(&Value::new(exponent))
    }

    pub fn relu(&self) -> Value {
        Value::new_derived(self.data().max(0.0), BackpropFunc::ReLU, &[self])
    }

    pub fn exp(&self) -> Value {
        Value::new_derived(self.data().exp(), BackpropFunc::Exp, &[self])
    }

    pub fn ln(&self) -> Value {
        Value::new_derived(self.data().ln(), BackpropFunc::Ln, &[self])
    }

    pub fn sqrt(&self) -> Value {
        Value::new_derived(self.data().sqrt(), BackpropFunc::Sqrt, &[self])
    }

    pub fn sigmoid(&self) -> Value {
        let x = self.data();
        Value::new_derived(1.0 / (1.0 + (-x).exp()), BackpropFunc::Sigmoid, &[self])
    }

    pub fn tanh(&self) -> Value {
        Value::new_derived(self.data().tanh(), BackpropFunc::Tanh, &[self])
    }

    /// Numerically `self`, but a new node whose history points back to `self`
    pub fn identity(&self) -> Value {
        Value::new_derived(self.data(), BackpropFunc::Identity, &[self])
    }
}

// pretty print a node in a JSON-like format, children are listed by id only so that
// printing stays flat however deep the graph is
impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        writeln!(f, "{{")?;
        writeln!(f, "  \"data\": {},", inner.data)?;
        writeln!(f, "  \"grad\": {:?},", inner.grad)?;
        writeln!(f, "  \"requires_grad\": {},", inner.requires_grad)?;
        writeln!(f, "  \"id\": {},", inner.id)?;
        writeln!(f, "  \"backprop_fn\": {:?},", inner.backprop_fn)?;
        writeln!(f, "  \"children\": {:?}", inner.child_ids())?;
        write!(f, "}}")
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Value").field(&*self.0.borrow()).finish()
    }
}

impl Add for &Value {
    type Output = Value;

    fn add(self, other: &Value) -> Value {
        Value::new_derived(self.data() + other.data(), BackpropFunc::Add, &[self, other])
    }
}

impl Sub for &Value {
    type Output = Value;

    fn sub(self, other: &Value) -> Value {
        Value::new_derived(self.data() - other.data(), BackpropFunc::Sub, &[self, other])
    }
}

impl Mul for &Value {
    type Output = Value;

    fn mul(self, other: &Value) -> Value {
        Value::new_derived(self.data() * other.data(), BackpropFunc::Mul, &[self, other])
    }
}

impl Div for &Value {
    type Output = Value;

    fn div(self, other: &Value) -> Value {
        Value::new_derived(self.data() / other.data(), BackpropFunc::Div, &[self, other])
    }
}

impl Neg for &Value {
    type Output = Value;

    fn neg(self) -> Value {
        Value::new_derived(-self.data(), BackpropFunc::Neg, &[self])
    }
}

impl Neg for Value {
    type Output = Value;

    fn neg(self) -> Value {
        -&self
    }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        let mut iter = iter;
        match iter.next() {
            Some(first) => iter.fold(first, |acc, v| acc + v),
            None => Value::new(0.0),
        }
    }
}

/// Convenience macro to implement operations on `[Value]` when ownership can be transferred
macro_rules! impl_arithmetic(
    ($trait:ident, $trait_method:ident, $operator:tt, $struct:ident) => {
        impl $trait for $struct {
            type Output = Self;

            fn $trait_method(self, other: Self) -> Self {
                &self $operator &other
            }
        }
    }
);
impl_arithmetic!(Add, add, +, Value);
impl_arithmetic!(Sub, sub, -, Value);
impl_arithmetic!(Mul, mul, *, Value);
impl_arithmetic!(Div, div, /, Value);

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.0.borrow().data == other.0.borrow().data
    }
}

impl Eq for Value {}

// unfortunate that there isn't a blanket impl for AsRef<T> for T
// <https://doc.rust-lang.org/std/convert/trait.AsRef.html#reflexivity>
impl AsRef<Value> for Value {
    fn as_ref(&self) -> &Value {
        self
    }
}

pub(crate) struct InnerValue {
    // the network uses 32 bit precision floats (roughly 7 decimal digits of precision)
    pub(crate) data: f32,
    /// gradient of the output with respect to this leaf, accumulated over backward passes
    pub(crate) grad: Option<f32>,
    pub(crate) requires_grad: bool,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedValue>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this value from its children
    /// `None` when the value is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerValue {
    fn child_ids(&self) -> Vec<u64> {
        self.children.iter().map(|c| c.borrow().id).collect()
    }

    pub fn new(data: f32, backprop_fn: Option<BackpropFunc>) -> Self {
        Self {
            data,
            grad: None,
            requires_grad: false,
            children: vec![],
            id: generate_random_id(),
            backprop_fn,
        }
    }
}

impl Debug for InnerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerValue")
            .field("data", &self.data)
            .field("grad", &self.grad)
            .field("requires_grad", &self.requires_grad)
            .field("id", &self.id)
            .field("backprop_fn", &self.backprop_fn)
            .field("children", &self.child_ids())
            .finish()
    }
}

// Long chains (e.g. many unrolled adaptation steps) would otherwise be dropped recursively
impl Drop for InnerValue {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.children);
        while let Some(child) = stack.pop() {
            if let Ok(cell) = Rc::try_unwrap(child) {
                let mut inner = cell.into_inner();
                stack.append(&mut inner.children);
            }
        }
    }
}

fn generate_random_id() -> u64 {
    let mut rng = rand::rng();
    rng.random() // generates a random u64
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::autograd::{GradOptions, grad};

    #[macro_export]
    macro_rules! assert_eq_float {
        ($a:expr, $b:expr) => {
            assert!((($a) - ($b)).abs() < 1e-5, "{} != {}", $a, $b);
        };
    }

    #[test]
    fn test_add() {
        let a = Value::variable(2.0);
        let b = Value::variable(3.0);

        let c = &a + &b;
        assert_eq!(c.data(), 5.0);
        c.backward();

        // dc/da = 1
        // dc/db = 1
        assert_eq!(a.grad(), Some(1.0));
        assert_eq!(b.grad(), Some(1.0));
    }

    #[test]
    fn test_mul() {
        let a = Value::variable(2.0);
        let b = Value::variable(3.0);

        let c = &a * &b;
        assert_eq!(c.data(), 6.0);

        c.backward();

        // dc/da = b
        // dc/db = a
        assert_eq!(a.grad(), Some(3.0));
        assert_eq!(b.grad(), Some(2.0));
    }

    #[test]
    fn test_neg() {
        let a = Value::variable(2.0);
        let b = -&a;
        assert_eq!(b.data(), -2.0);

        b.backward();

        assert_eq!(a.grad(), Some(-1.0));
    }

    #[test]
    fn test_sub() {
        let a = Value::variable(2.0);
        let b = Value::variable(3.0);

        let c = &a - &b;
        assert_eq!(c.data(), -1.0);

        c.backward();

        // dc/da = 1
        // dc/db = -1
        assert_eq!(a.grad(), Some(1.0));
        assert_eq!(b.grad(), Some(-1.0));
    }

    #[test]
    fn test_div() {
        let a = Value::variable(2.0);
        let b = Value::variable(3.0);

        let c = &a / &b;
        assert_eq_float!(c.data(), 2.0 / 3.0);

        c.backward();

        // dc/da = 1/b
        // dc/db = -a/b^2
        assert_eq_float!(a.grad().unwrap(), 1.0 / 3.0);
        assert_eq_float!(b.grad().unwrap(), -2.0 / 9.0);
    }

    #[test]
    fn test_pow() {
        let a = Value::variable(2.0);
        let b = Value::new(2.0);
        let c = a.pow(&b);
        assert_eq_float!(c.data(), 4.0);

        c.backward();

        // dc/da = 2a, the exponent is a constant
        assert_eq_float!(a.grad().unwrap(), 4.0);
        assert_eq!(b.grad(), None);
    }

    #[test]
    fn test_relu() {
        let a = Value::variable(1.0);
        let b = Value::variable(2.0);
        let c = &a * &b;
        let z = c.relu();
        assert_eq_float!(z.data(), 2.0);

        z.backward();

        // dz/dc = 1
        // dc/da = b
        // dc/db = a
        assert_eq_float!(a.grad().unwrap(), 2.0);
        assert_eq_float!(b.grad().unwrap(), 1.0);
        // intermediate adjoints are not retained
        assert_eq!(c.grad(), None);
    }

    #[test]
    fn test_sigmoid_and_sqrt() {
        let a = Value::variable(0.5);
        let s = a.sigmoid();
        s.backward();
        let sd = s.data();
        assert_eq_float!(a.grad().unwrap(), sd * (1.0 - sd));

        let b = Value::variable(4.0);
        b.sqrt().backward();
        assert_eq_float!(b.grad().unwrap(), 0.25);
    }

    #[test]
    fn test_grads_accumulate_until_zeroed() {
        let mut a = Value::variable(3.0);
        let c = &a * &a;
        c.backward();
        c.backward();
        assert_eq_float!(a.grad().unwrap(), 12.0);
        a.zero_grad();
        assert_eq!(a.grad(), None);
        c.backward();
        assert_eq_float!(a.grad().unwrap(), 6.0);
    }

    #[test]
    fn test_constants_are_not_tracked() {
        let a = Value::new(2.0);
        let b = Value::new(3.0);
        let c = &a * &b;
        assert!(!c.requires_grad());
        assert!(c.is_leaf());
        c.backward();
        assert_eq!(a.grad(), None);
    }

    #[test]
    fn test_no_grad_scope() {
        let a = Value::variable(2.0);
        let c = no_grad(|| &a * &a);
        assert!(!c.requires_grad());
        assert!(is_grad_enabled());
        let d = no_grad(|| enable_grad(|| &a * &a));
        assert!(d.requires_grad());
    }

    #[test]
    fn test_identity_is_linked() {
        let a = Value::variable(1.5);
        let b = a.identity();
        assert_eq!(a, b);
        assert!(!b.is_leaf());
        (&b * &b).backward();
        assert_eq_float!(a.grad().unwrap(), 3.0);
        assert!(!a.detach().requires_grad());
    }

    #[test]
    fn test_second_derivative() {
        // y = x^3, dy/dx = 3x^2, d2y/dx2 = 6x
        let x = Value::variable(2.0);
        let y = x.powf(3.0);
        let dy = grad(
            &y,
            &[x.clone()],
            GradOptions {
                create_graph: true,
                allow_unused: false,
            },
        )
        .unwrap()
        .remove(0)
        .unwrap();
        assert_eq_float!(dy.data(), 12.0);
        assert!(dy.requires_grad());
        dy.backward();
        assert_eq_float!(x.grad().unwrap(), 12.0);
    }

    #[test]
    fn test_deep_graph_does_not_overflow() {
        let a = Value::variable(1.0);
        let mut acc = Value::new(0.0);
        for _ in 0..50_000 {
            acc = &acc + &a;
        }
        acc.backward();
        assert_eq_float!(a.grad().unwrap(), 50_000.0);
    }

    #[test]
    fn test_printing_lists_children_by_id() {
        let a = Value::variable(1.0);
        let mut acc = Value::new(0.0);
        for _ in 0..50_000 {
            acc = &acc + &a;
        }
        let debug = format!("{:?}", acc);
        let display = acc.to_string();
        let a_id = a.id().to_string();
        assert!(debug.contains(&a_id));
        assert!(display.contains(&a_id));
        assert!(display.contains("\"backprop_fn\": Some(Add)"));
        // one node, not the whole chain
        assert_eq!(display.lines().count(), 8);
    }
}
