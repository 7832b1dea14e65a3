//! Row expressions used by Map and Filter nodes
//!
//! Booleans are represented as `Integer(0)` / `Integer(1)`. Missing values
//! propagate through arithmetic and comparisons; `And` and `Or` only look
//! at their right operand when the left one does not decide the result.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tabula_core::{Batch, DataType, Error, Result, Schema, Value};

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// Addition, or concatenation of strings
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division, always floating point
    Div,
    /// Remainder
    Mod,
    /// Equal
    Eq,
    /// Not equal
    NotEq,
    /// Less than
    Lt,
    /// Less than or equal
    LtEq,
    /// Greater than
    Gt,
    /// Greater than or equal
    GtEq,
    /// Logical and
    And,
    /// Logical or
    Or,
}

impl BinaryOp {
    fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod)
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::NotEq | Self::Lt | Self::LtEq | Self::Gt | Self::GtEq
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "AND",
            Self::Or => "OR",
        };
        f.write_str(s)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// Logical negation
    Not,
    /// Arithmetic negation
    Neg,
    /// 1 when the operand is missing, 0 otherwise
    IsMissing,
}

/// A user function callable from expressions
pub trait ScalarUdf: Send + Sync + fmt::Debug {
    /// Name shown in plans and errors
    fn name(&self) -> &str;

    /// Declared type of every result
    fn return_type(&self) -> DataType;

    /// Evaluate for one row
    fn invoke(&self, args: &[Value]) -> Result<Value>;
}

/// A [`ScalarUdf`] backed by a closure
pub struct FnUdf<F> {
    name: String,
    return_type: DataType,
    func: F,
}

impl<F> FnUdf<F>
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
{
    /// Wrap `func` as a user function
    pub fn new(name: impl Into<String>, return_type: DataType, func: F) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            return_type,
            func,
        })
    }
}

impl<F> fmt::Debug for FnUdf<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnUdf")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .finish()
    }
}

impl<F> ScalarUdf for FnUdf<F>
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn return_type(&self) -> DataType {
        self.return_type
    }

    fn invoke(&self, args: &[Value]) -> Result<Value> {
        (self.func)(args)
    }
}

/// An expression over the columns of one row
#[derive(Debug, Clone)]
pub enum Expr {
    /// Column reference
    Column(String),
    /// Constant
    Literal(Value),
    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        left: Box<Expr>,
        /// Right operand
        right: Box<Expr>,
    },
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        expr: Box<Expr>,
    },
    /// User function call with any number of arguments
    Function {
        /// The function
        udf: Arc<dyn ScalarUdf>,
        /// Arguments
        args: Vec<Expr>,
    },
}

/// Column reference
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

/// Literal value
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

/// Call a user function
pub fn call(udf: Arc<dyn ScalarUdf>, args: Vec<Expr>) -> Expr {
    Expr::Function { udf, args }
}

fn bool_value(b: bool) -> Value {
    Value::Integer(i64::from(b))
}

macro_rules! binary_builders {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            #[doc = concat!("`self ", stringify!($op), " other`")]
            pub fn $name(self, other: Expr) -> Expr {
                self.binary(BinaryOp::$op, other)
            }
        )*
    };
}

impl Expr {
    fn binary(self, op: BinaryOp, other: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    binary_builders! {
        add => Add,
        sub => Sub,
        mul => Mul,
        div => Div,
        modulo => Mod,
        eq => Eq,
        not_eq => NotEq,
        lt => Lt,
        lt_eq => LtEq,
        gt => Gt,
        gt_eq => GtEq,
        and => And,
        or => Or,
    }

    /// Logical negation
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    /// Arithmetic negation
    #[allow(clippy::should_implement_trait)]
    pub fn neg(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(self),
        }
    }

    /// 1 when missing, 0 otherwise
    pub fn is_missing(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::IsMissing,
            expr: Box::new(self),
        }
    }

    /// Names of every referenced column
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Column(name) => {
                out.insert(name.clone());
            }
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Unary { expr, .. } => expr.collect_columns(out),
            Expr::Function { args, .. } => args.iter().for_each(|a| a.collect_columns(out)),
        }
    }

    /// Number of references to column `name`
    pub fn count_references(&self, name: &str) -> usize {
        match self {
            Expr::Column(n) => usize::from(n == name),
            Expr::Literal(_) => 0,
            Expr::Binary { left, right, .. } => {
                left.count_references(name) + right.count_references(name)
            }
            Expr::Unary { expr, .. } => expr.count_references(name),
            Expr::Function { args, .. } => args.iter().map(|a| a.count_references(name)).sum(),
        }
    }

    /// Whether evaluation can fail or has observable cost beyond arithmetic
    pub fn has_function(&self) -> bool {
        match self {
            Expr::Column(_) | Expr::Literal(_) => false,
            Expr::Binary { left, right, .. } => left.has_function() || right.has_function(),
            Expr::Unary { expr, .. } => expr.has_function(),
            Expr::Function { .. } => true,
        }
    }

    /// The referenced column if this is a bare column reference
    pub fn as_column(&self) -> Option<&str> {
        match self {
            Expr::Column(name) => Some(name),
            _ => None,
        }
    }

    /// Whether this is a literal that every row passes as a predicate
    pub fn is_always_true(&self) -> bool {
        matches!(self, Expr::Literal(v) if !v.is_missing() && v.is_truthy())
    }

    /// Whether this is a literal that no row passes as a predicate
    pub fn is_always_false(&self) -> bool {
        matches!(self, Expr::Literal(v) if v.is_missing() || !v.is_truthy())
    }

    /// Replace column references found in `mapping`
    pub fn substitute(&self, mapping: &HashMap<String, Expr>) -> Expr {
        match self {
            Expr::Column(name) => mapping.get(name).cloned().unwrap_or_else(|| self.clone()),
            Expr::Literal(_) => self.clone(),
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(left.substitute(mapping)),
                right: Box::new(right.substitute(mapping)),
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op: *op,
                expr: Box::new(expr.substitute(mapping)),
            },
            Expr::Function { udf, args } => Expr::Function {
                udf: Arc::clone(udf),
                args: args.iter().map(|a| a.substitute(mapping)).collect(),
            },
        }
    }

    /// Result type against `schema`; unknown columns and ill-typed
    /// operations are rejected here, before any data is read
    pub fn data_type(&self, schema: &Schema) -> Result<DataType> {
        match self {
            Expr::Column(name) => Ok(schema.field_by_name(name)?.data_type),
            Expr::Literal(v) => Ok(v.data_type().unwrap_or(DataType::Dynamic)),
            Expr::Binary { op, left, right } => {
                let l = left.data_type(schema)?;
                let r = right.data_type(schema)?;
                binary_type(*op, l, r)
            }
            Expr::Unary { op, expr } => {
                let t = expr.data_type(schema)?;
                match op {
                    UnaryOp::Not | UnaryOp::IsMissing => Ok(DataType::Integer),
                    UnaryOp::Neg if t.is_numeric() || t == DataType::Dynamic => Ok(t),
                    UnaryOp::Neg => Err(Error::type_mismatch(&DataType::Float, t)),
                }
            }
            Expr::Function { udf, args } => {
                for arg in args {
                    arg.data_type(schema)?;
                }
                Ok(udf.return_type())
            }
        }
    }

    /// Resolve column references to positions in `schema`
    pub fn bind(&self, schema: &Schema) -> Result<BoundExpr> {
        self.data_type(schema)?;
        Ok(BoundExpr {
            node: self.bind_node(schema)?,
        })
    }

    fn bind_node(&self, schema: &Schema) -> Result<Bound> {
        Ok(match self {
            Expr::Column(name) => Bound::Column(schema.index_of(name)?),
            Expr::Literal(v) => Bound::Literal(v.clone()),
            Expr::Binary { op, left, right } => Bound::Binary {
                op: *op,
                left: Box::new(left.bind_node(schema)?),
                right: Box::new(right.bind_node(schema)?),
            },
            Expr::Unary { op, expr } => Bound::Unary {
                op: *op,
                expr: Box::new(expr.bind_node(schema)?),
            },
            Expr::Function { udf, args } => Bound::Function {
                udf: Arc::clone(udf),
                args: args.iter().map(|a| a.bind_node(schema)).collect::<Result<_>>()?,
            },
        })
    }
}

fn binary_type(op: BinaryOp, l: DataType, r: DataType) -> Result<DataType> {
    use DataType::*;
    let dynamic = l == Dynamic || r == Dynamic;
    if op.is_arithmetic() {
        return match (l, r) {
            _ if dynamic => Ok(Dynamic),
            (String, String) if op == BinaryOp::Add => Ok(String),
            _ if l.is_numeric() && r.is_numeric() => Ok(match op {
                BinaryOp::Div => Float,
                _ if l == Integer && r == Integer => Integer,
                _ => Float,
            }),
            _ if !l.is_numeric() => Err(Error::type_mismatch(&Float, l)),
            _ => Err(Error::type_mismatch(&Float, r)),
        };
    }
    if op.is_comparison() && !dynamic && l != r && !(l.is_numeric() && r.is_numeric()) {
        return Err(Error::type_mismatch(&l, r));
    }
    Ok(Integer)
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expr::Column(a), Expr::Column(b)) => a == b,
            (Expr::Literal(a), Expr::Literal(b)) => a == b,
            (
                Expr::Binary { op, left, right },
                Expr::Binary {
                    op: op2,
                    left: left2,
                    right: right2,
                },
            ) => op == op2 && left == left2 && right == right2,
            (Expr::Unary { op, expr }, Expr::Unary { op: op2, expr: expr2 }) => {
                op == op2 && expr == expr2
            }
            (Expr::Function { udf, args }, Expr::Function { udf: udf2, args: args2 }) => {
                Arc::ptr_eq(udf, udf2) && args == args2
            }
            _ => false,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "{}", name),
            Expr::Literal(Value::String(s)) => write!(f, "{:?}", s),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Binary { op, left, right } => write!(f, "({} {} {})", left, op, right),
            Expr::Unary { op: UnaryOp::Not, expr } => write!(f, "NOT {}", expr),
            Expr::Unary { op: UnaryOp::Neg, expr } => write!(f, "-{}", expr),
            Expr::Unary {
                op: UnaryOp::IsMissing,
                expr,
            } => write!(f, "is_missing({})", expr),
            Expr::Function { udf, args } => {
                write!(f, "{}(", udf.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Bound {
    Column(usize),
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Box<Bound>,
        right: Box<Bound>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Bound>,
    },
    Function {
        udf: Arc<dyn ScalarUdf>,
        args: Vec<Bound>,
    },
}

/// An expression whose column references are resolved to positions
#[derive(Debug, Clone)]
pub struct BoundExpr {
    node: Bound,
}

impl BoundExpr {
    /// Evaluate every row of `batch`
    pub fn evaluate(&self, batch: &Batch) -> Result<Vec<Value>> {
        let columns = batch.columns();
        (0..batch.num_rows())
            .map(|row| self.node.eval(columns, row))
            .collect()
    }

    /// Evaluate as a predicate: true where the result is present and truthy
    pub fn evaluate_mask(&self, batch: &Batch) -> Result<Vec<bool>> {
        let columns = batch.columns();
        (0..batch.num_rows())
            .map(|row| self.node.eval(columns, row).map(|v| truthy(&v)))
            .collect()
    }
}

fn truthy(v: &Value) -> bool {
    !v.is_missing() && v.is_truthy()
}

impl Bound {
    fn eval(&self, columns: &[Vec<Value>], row: usize) -> Result<Value> {
        match self {
            Bound::Column(i) => Ok(columns[*i][row].clone()),
            Bound::Literal(v) => Ok(v.clone()),
            Bound::Unary { op, expr } => {
                let v = expr.eval(columns, row)?;
                Ok(match op {
                    UnaryOp::IsMissing => bool_value(v.is_missing()),
                    _ if v.is_missing() => Value::Missing,
                    UnaryOp::Not => bool_value(!v.is_truthy()),
                    UnaryOp::Neg => match v {
                        Value::Integer(i) => Value::Integer(i.wrapping_neg()),
                        Value::Float(x) => Value::Float(-x),
                        other => return Err(Error::type_mismatch(&DataType::Float, other.type_name())),
                    },
                })
            }
            Bound::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let l = left.eval(columns, row)?;
                if l.is_missing() {
                    return Ok(Value::Missing);
                }
                if !l.is_truthy() {
                    return Ok(bool_value(false));
                }
                let r = right.eval(columns, row)?;
                Ok(if r.is_missing() {
                    Value::Missing
                } else {
                    bool_value(r.is_truthy())
                })
            }
            Bound::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                let l = left.eval(columns, row)?;
                if l.is_missing() {
                    return Ok(Value::Missing);
                }
                if l.is_truthy() {
                    return Ok(bool_value(true));
                }
                let r = right.eval(columns, row)?;
                Ok(if r.is_missing() {
                    Value::Missing
                } else {
                    bool_value(r.is_truthy())
                })
            }
            Bound::Binary { op, left, right } => {
                let l = left.eval(columns, row)?;
                let r = right.eval(columns, row)?;
                if l.is_missing() || r.is_missing() {
                    return Ok(Value::Missing);
                }
                if op.is_comparison() {
                    let ord = compare_values(&l, &r);
                    return Ok(bool_value(match op {
                        BinaryOp::Eq => ord == Ordering::Equal,
                        BinaryOp::NotEq => ord != Ordering::Equal,
                        BinaryOp::Lt => ord == Ordering::Less,
                        BinaryOp::LtEq => ord != Ordering::Greater,
                        BinaryOp::Gt => ord == Ordering::Greater,
                        _ => ord != Ordering::Less,
                    }));
                }
                arithmetic(*op, l, r)
            }
            Bound::Function { udf, args } => {
                let args = args
                    .iter()
                    .map(|a| a.eval(columns, row))
                    .collect::<Result<Vec<_>>>()?;
                let out = udf.invoke(&args).map_err(|e| match e {
                    Error::Udf { .. } => e,
                    other => Error::Udf {
                        name: udf.name().to_string(),
                        message: other.to_string(),
                    },
                })?;
                let return_type = udf.return_type();
                if !return_type.accepts(&out) {
                    return Err(Error::Udf {
                        name: udf.name().to_string(),
                        message: format!("returned {} but declares {}", out.type_name(), return_type),
                    });
                }
                return_type.coerce(out)
            }
        }
    }
}

/// Ordering used by comparisons: numbers compare numerically across
/// Integer and Float, everything else by the value order
pub fn compare_values(l: &Value, r: &Value) -> Ordering {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
        (Value::Integer(_), Value::Float(_)) | (Value::Float(_), Value::Integer(_)) => {
            let a = l.as_f64().unwrap_or(f64::NAN);
            let b = r.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        }
        _ => l.cmp(r),
    }
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    Ok(match (op, l, r) {
        (BinaryOp::Add, Value::String(a), Value::String(b)) => Value::String(a + &b),
        (BinaryOp::Div, l, r) => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => Value::Float(a / b),
            _ => return Err(Error::type_mismatch(&DataType::Float, mismatched(&l, &r))),
        },
        (op, Value::Integer(a), Value::Integer(b)) => match op {
            BinaryOp::Add => Value::Integer(a.wrapping_add(b)),
            BinaryOp::Sub => Value::Integer(a.wrapping_sub(b)),
            BinaryOp::Mul => Value::Integer(a.wrapping_mul(b)),
            _ => a.checked_rem(b).map(Value::Integer).unwrap_or(Value::Missing),
        },
        (op, l, r) => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => Value::Float(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                _ => a % b,
            }),
            _ => return Err(Error::type_mismatch(&DataType::Float, mismatched(&l, &r))),
        },
    })
}

fn mismatched(l: &Value, r: &Value) -> &'static str {
    if l.as_f64().is_none() {
        l.type_name()
    } else {
        r.type_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::Field;
    use test_case::test_case;

    fn batch() -> Batch {
        let schema = Arc::new(
            Schema::new(vec![
                Field::new("x", DataType::Integer),
                Field::new("y", DataType::Float),
                Field::new("s", DataType::String),
            ])
            .unwrap(),
        );
        Batch::from_rows(
            schema,
            vec![
                vec![Value::Integer(1), Value::Float(0.5), Value::from("a")],
                vec![Value::Integer(6), Value::Missing, Value::from("b")],
                vec![Value::Missing, Value::Float(2.0), Value::from("c")],
            ],
        )
        .unwrap()
    }

    fn eval(expr: Expr) -> Vec<Value> {
        let b = batch();
        expr.bind(b.schema()).unwrap().evaluate(&b).unwrap()
    }

    #[test]
    fn test_arithmetic_propagates_missing() {
        assert_eq!(
            eval(col("x").add(lit(1i64))),
            vec![Value::Integer(2), Value::Integer(7), Value::Missing]
        );
        assert_eq!(
            eval(col("x").mul(col("y"))),
            vec![Value::Float(0.5), Value::Missing, Value::Missing]
        );
        assert_eq!(eval(col("x").div(lit(2i64)))[1], Value::Float(3.0));
        assert_eq!(eval(col("x").modulo(lit(0i64)))[0], Value::Missing);
        assert_eq!(eval(col("s").add(lit("!")))[2], Value::from("c!"));
    }

    #[test]
    fn test_comparisons_and_logic() {
        let gt = eval(col("x").gt(lit(5i64)));
        assert_eq!(gt, vec![Value::Integer(0), Value::Integer(1), Value::Missing]);
        let mixed = eval(col("y").lt_eq(col("x")));
        assert_eq!(mixed[0], Value::Integer(1));

        let and = eval(col("x").gt(lit(5i64)).and(col("y").is_missing()));
        assert_eq!(and, vec![Value::Integer(0), Value::Integer(1), Value::Missing]);
        let or = eval(col("x").gt(lit(5i64)).or(lit(1i64)).not());
        assert_eq!(or, vec![Value::Integer(0), Value::Integer(0), Value::Missing]);
    }

    #[test]
    fn test_and_short_circuits_function_calls() {
        let fail = FnUdf::new("boom", DataType::Integer, |_: &[Value]| {
            Err(Error::InvalidArgument("called".into()))
        });
        let expr = lit(0i64).and(call(fail.clone(), vec![col("x")]));
        assert_eq!(eval(expr), vec![Value::Integer(0); 3]);

        let b = batch();
        let err = call(fail, vec![])
            .bind(b.schema())
            .unwrap()
            .evaluate(&b)
            .unwrap_err();
        assert!(matches!(err, Error::Udf { ref name, .. } if name == "boom"));
    }

    #[test]
    fn test_udf_return_type_is_enforced() {
        let liar = FnUdf::new("liar", DataType::Integer, |_: &[Value]| Ok(Value::from("no")));
        let b = batch();
        let bound = call(liar, vec![col("s")]).bind(b.schema()).unwrap();
        assert!(matches!(bound.evaluate(&b), Err(Error::Udf { .. })));
    }

    #[test_case(col("nope"), "column" ; "unknown column")]
    #[test_case(col("s").sub(lit(1i64)), "type" ; "string arithmetic")]
    #[test_case(col("s").lt(lit(1i64)), "type" ; "string vs int comparison")]
    #[test_case(col("s").neg(), "type" ; "negated string")]
    fn test_invalid_expressions_rejected(expr: Expr, kind: &str) {
        let err = expr.data_type(batch().schema()).unwrap_err();
        match kind {
            "column" => assert!(matches!(err, Error::ColumnNotFound(_))),
            _ => assert!(matches!(err, Error::TypeMismatch { .. })),
        }
    }

    #[test]
    fn test_substitute_and_columns() {
        let expr = col("a").add(col("b")).gt(col("a"));
        assert_eq!(expr.count_references("a"), 2);
        let mut mapping = HashMap::new();
        mapping.insert("a".to_string(), col("x"));
        let replaced = expr.substitute(&mapping);
        assert_eq!(
            replaced.columns().into_iter().collect::<Vec<_>>(),
            vec!["b".to_string(), "x".to_string()]
        );
        assert_eq!(replaced.to_string(), "((x + b) > x)");
    }
}
