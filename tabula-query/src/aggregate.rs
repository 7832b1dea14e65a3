//! Grouped aggregate functions

use std::collections::{HashMap, HashSet};
use std::fmt;

use tabula_core::{DataType, Error, Result, Schema, Value};

/// What an aggregate computes over the rows of one group
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateFunction {
    /// Number of rows, or of present values when an input column is given
    Count,
    /// Sum of present values; 0 for a group without any
    Sum,
    /// Arithmetic mean
    Mean,
    /// Smallest present value
    Min,
    /// Largest present value
    Max,
    /// Value of column `value` on the row where the input is smallest
    ArgMin {
        /// Column whose value is returned
        value: String,
    },
    /// Value of column `value` on the row where the input is largest
    ArgMax {
        /// Column whose value is returned
        value: String,
    },
    /// Population variance
    Variance,
    /// Population standard deviation
    Stdv,
    /// Number of distinct values, missing included
    CountDistinct,
    /// Distinct values in order of first appearance, missing included
    Distinct,
    /// Every present value in row order
    List,
    /// First value of the group
    SelectOne,
    /// Dictionary from each present value to the number of its occurrences
    FrequencyCount,
    /// Exact nearest-rank quantiles, one per requested fraction
    Quantile(Vec<f64>),
}

impl AggregateFunction {
    /// Output type for an input column of type `input`, validating the
    /// pairing
    pub fn output_type(&self, input: Option<DataType>, schema: &Schema) -> Result<DataType> {
        use AggregateFunction::*;
        let input = match (self, input) {
            (Count, None) => return Ok(DataType::Integer),
            (_, None) => {
                return Err(Error::InvalidArgument(format!(
                    "aggregate {} needs an input column",
                    self
                )))
            }
            (_, Some(t)) => t,
        };
        let numeric = input.is_numeric() || input == DataType::Dynamic;
        let orderable = numeric || matches!(input, DataType::String | DataType::DateTime);
        match self {
            Count | CountDistinct => Ok(DataType::Integer),
            Sum if numeric => Ok(input),
            Mean | Variance | Stdv if numeric => Ok(DataType::Float),
            Min | Max if orderable => Ok(input),
            ArgMin { value } | ArgMax { value } if orderable => {
                Ok(schema.field_by_name(value)?.data_type)
            }
            Quantile(fractions) if numeric => {
                if fractions.is_empty() || fractions.iter().any(|q| !(0.0..=1.0).contains(q)) {
                    return Err(Error::InvalidArgument(format!(
                        "quantiles must be within [0, 1], got {:?}",
                        fractions
                    )));
                }
                Ok(DataType::List)
            }
            Distinct | List => Ok(DataType::List),
            SelectOne => Ok(input),
            FrequencyCount => Ok(DataType::Dict),
            _ => Err(Error::type_mismatch(&DataType::Float, input)),
        }
    }

    /// Fresh per-group state
    pub fn accumulator(&self, input_type: Option<DataType>) -> Box<dyn Accumulator> {
        use AggregateFunction::*;
        match self {
            Count => Box::new(CountAcc {
                count: 0,
                skip_missing: input_type.is_some(),
            }),
            Sum => Box::new(SumAcc {
                int: 0,
                float: 0.0,
                is_float: false,
                float_input: input_type == Some(DataType::Float),
            }),
            Mean => Box::new(MomentsAcc::new(Moment::Mean)),
            Variance => Box::new(MomentsAcc::new(Moment::Variance)),
            Stdv => Box::new(MomentsAcc::new(Moment::Stdv)),
            Min => Box::new(ExtremeAcc::new(false)),
            Max => Box::new(ExtremeAcc::new(true)),
            ArgMin { .. } => Box::new(ArgAcc::new(false)),
            ArgMax { .. } => Box::new(ArgAcc::new(true)),
            CountDistinct => Box::new(DistinctAcc::new(true)),
            Distinct => Box::new(DistinctAcc::new(false)),
            List => Box::new(ListAcc(Vec::new())),
            SelectOne => Box::new(SelectOneAcc(None)),
            FrequencyCount => Box::new(FrequencyAcc::default()),
            Quantile(fractions) => Box::new(QuantileAcc {
                fractions: fractions.clone(),
                values: Vec::new(),
            }),
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use AggregateFunction::*;
        match self {
            Count => write!(f, "count"),
            Sum => write!(f, "sum"),
            Mean => write!(f, "mean"),
            Min => write!(f, "min"),
            Max => write!(f, "max"),
            ArgMin { value } => write!(f, "argmin[{}]", value),
            ArgMax { value } => write!(f, "argmax[{}]", value),
            Variance => write!(f, "var"),
            Stdv => write!(f, "stdv"),
            CountDistinct => write!(f, "count_distinct"),
            Distinct => write!(f, "distinct"),
            List => write!(f, "list"),
            SelectOne => write!(f, "select_one"),
            FrequencyCount => write!(f, "frequency_count"),
            Quantile(q) => write!(f, "quantile{:?}", q),
        }
    }
}

/// One output column of a Reduce node
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    /// Function to apply
    pub func: AggregateFunction,
    /// Input column; only `Count` may omit it
    pub input: Option<String>,
    /// Output column name
    pub output: String,
}

impl AggregateExpr {
    /// Aggregate over `input`, written to `output`
    pub fn new(func: AggregateFunction, input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            func,
            input: Some(input.into()),
            output: output.into(),
        }
    }

    /// Row count, written to `output`
    pub fn count(output: impl Into<String>) -> Self {
        Self {
            func: AggregateFunction::Count,
            input: None,
            output: output.into(),
        }
    }

    /// Columns read by this aggregate
    pub fn columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.input.iter().map(String::as_str).collect();
        if let AggregateFunction::ArgMin { value } | AggregateFunction::ArgMax { value } = &self.func {
            out.push(value);
        }
        out
    }

    /// Output type against the input schema
    pub fn output_type(&self, schema: &Schema) -> Result<DataType> {
        let input = match &self.input {
            Some(name) => Some(schema.field_by_name(name)?.data_type),
            None => None,
        };
        self.func.output_type(input, schema)
    }
}

impl fmt::Display for AggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.input {
            Some(input) => write!(f, "{}({}) AS {}", self.func, input, self.output),
            None => write!(f, "{}(*) AS {}", self.func, self.output),
        }
    }
}

/// Running state of one aggregate over one group
pub trait Accumulator: Send + fmt::Debug {
    /// Feed one row. `extra` is the ArgMin/ArgMax value column, Missing
    /// otherwise.
    fn update(&mut self, value: &Value, extra: &Value) -> Result<()>;

    /// Final value
    fn finish(&self) -> Value;
}

#[derive(Debug)]
struct CountAcc {
    count: i64,
    skip_missing: bool,
}

impl Accumulator for CountAcc {
    fn update(&mut self, value: &Value, _: &Value) -> Result<()> {
        if !(self.skip_missing && value.is_missing()) {
            self.count += 1;
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        Value::Integer(self.count)
    }
}

#[derive(Debug)]
struct SumAcc {
    int: i64,
    float: f64,
    is_float: bool,
    float_input: bool,
}

impl Accumulator for SumAcc {
    fn update(&mut self, value: &Value, _: &Value) -> Result<()> {
        match value {
            Value::Missing => {}
            Value::Integer(i) => {
                self.int = self.int.wrapping_add(*i);
                self.float += *i as f64;
            }
            Value::Float(x) => {
                self.is_float = true;
                self.float += x;
            }
            other => return Err(Error::type_mismatch(&DataType::Float, other.type_name())),
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        if self.is_float || self.float_input {
            Value::Float(self.float)
        } else {
            Value::Integer(self.int)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Moment {
    Mean,
    Variance,
    Stdv,
}

/// Welford's online mean and variance
#[derive(Debug)]
struct MomentsAcc {
    moment: Moment,
    count: u64,
    mean: f64,
    m2: f64,
}

impl MomentsAcc {
    fn new(moment: Moment) -> Self {
        Self {
            moment,
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }
}

impl Accumulator for MomentsAcc {
    fn update(&mut self, value: &Value, _: &Value) -> Result<()> {
        if value.is_missing() {
            return Ok(());
        }
        let x = value
            .as_f64()
            .ok_or_else(|| Error::type_mismatch(&DataType::Float, value.type_name()))?;
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        Ok(())
    }

    fn finish(&self) -> Value {
        let variance = if self.count <= 1 {
            0.0
        } else {
            self.m2 / self.count as f64
        };
        match self.moment {
            Moment::Mean if self.count == 0 => Value::Missing,
            Moment::Mean => Value::Float(self.mean),
            Moment::Variance => Value::Float(variance),
            Moment::Stdv => Value::Float(variance.sqrt()),
        }
    }
}

#[derive(Debug)]
struct ExtremeAcc {
    max: bool,
    best: Option<Value>,
}

impl ExtremeAcc {
    fn new(max: bool) -> Self {
        Self { max, best: None }
    }
}

fn better(max: bool, candidate: &Value, best: &Value) -> bool {
    let ord = crate::expr::compare_values(candidate, best);
    if max {
        ord.is_gt()
    } else {
        ord.is_lt()
    }
}

impl Accumulator for ExtremeAcc {
    fn update(&mut self, value: &Value, _: &Value) -> Result<()> {
        if value.is_missing() {
            return Ok(());
        }
        let replace = match &self.best {
            None => true,
            Some(best) => better(self.max, value, best),
        };
        if replace {
            self.best = Some(value.clone());
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        self.best.clone().unwrap_or_default()
    }
}

#[derive(Debug)]
struct ArgAcc {
    max: bool,
    best: Option<(Value, Value)>,
}

impl ArgAcc {
    fn new(max: bool) -> Self {
        Self { max, best: None }
    }
}

impl Accumulator for ArgAcc {
    fn update(&mut self, value: &Value, extra: &Value) -> Result<()> {
        if value.is_missing() {
            return Ok(());
        }
        let replace = match &self.best {
            None => true,
            Some((best, _)) => better(self.max, value, best),
        };
        if replace {
            self.best = Some((value.clone(), extra.clone()));
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        self.best.as_ref().map(|(_, v)| v.clone()).unwrap_or_default()
    }
}

#[derive(Debug)]
struct DistinctAcc {
    count_only: bool,
    seen: HashSet<Value>,
    order: Vec<Value>,
}

impl DistinctAcc {
    fn new(count_only: bool) -> Self {
        Self {
            count_only,
            seen: HashSet::new(),
            order: Vec::new(),
        }
    }
}

impl Accumulator for DistinctAcc {
    fn update(&mut self, value: &Value, _: &Value) -> Result<()> {
        if self.seen.insert(value.clone()) && !self.count_only {
            self.order.push(value.clone());
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        if self.count_only {
            Value::Integer(self.seen.len() as i64)
        } else {
            Value::List(self.order.clone())
        }
    }
}

#[derive(Debug)]
struct ListAcc(Vec<Value>);

impl Accumulator for ListAcc {
    fn update(&mut self, value: &Value, _: &Value) -> Result<()> {
        if !value.is_missing() {
            self.0.push(value.clone());
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        Value::List(self.0.clone())
    }
}

#[derive(Debug)]
struct SelectOneAcc(Option<Value>);

impl Accumulator for SelectOneAcc {
    fn update(&mut self, value: &Value, _: &Value) -> Result<()> {
        if self.0.is_none() {
            self.0 = Some(value.clone());
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        self.0.clone().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct FrequencyAcc {
    index: HashMap<Value, usize>,
    counts: Vec<(Value, i64)>,
}

impl Accumulator for FrequencyAcc {
    fn update(&mut self, value: &Value, _: &Value) -> Result<()> {
        if value.is_missing() {
            return Ok(());
        }
        match self.index.get(value) {
            Some(&i) => self.counts[i].1 += 1,
            None => {
                self.index.insert(value.clone(), self.counts.len());
                self.counts.push((value.clone(), 1));
            }
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        Value::Dict(
            self.counts
                .iter()
                .map(|(v, n)| (v.clone(), Value::Integer(*n)))
                .collect(),
        )
    }
}

#[derive(Debug)]
struct QuantileAcc {
    fractions: Vec<f64>,
    values: Vec<f64>,
}

impl Accumulator for QuantileAcc {
    fn update(&mut self, value: &Value, _: &Value) -> Result<()> {
        if value.is_missing() {
            return Ok(());
        }
        let x = value
            .as_f64()
            .ok_or_else(|| Error::type_mismatch(&DataType::Float, value.type_name()))?;
        self.values.push(x);
        Ok(())
    }

    fn finish(&self) -> Value {
        if self.values.is_empty() {
            return Value::Missing;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);
        let last = (sorted.len() - 1) as f64;
        Value::List(
            self.fractions
                .iter()
                .map(|q| Value::Float(sorted[(q * last).round() as usize]))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tabula_core::Field;
    use test_case::test_case;

    fn run(func: AggregateFunction, input: DataType, values: &[Value]) -> Value {
        let mut acc = func.accumulator(Some(input));
        for v in values {
            acc.update(v, &Value::Missing).unwrap();
        }
        acc.finish()
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Integer).collect()
    }

    #[test_case(AggregateFunction::Sum, Value::Integer(10) ; "sum")]
    #[test_case(AggregateFunction::Mean, Value::Float(2.5) ; "mean")]
    #[test_case(AggregateFunction::Min, Value::Integer(1) ; "min")]
    #[test_case(AggregateFunction::Max, Value::Integer(4) ; "max")]
    #[test_case(AggregateFunction::Variance, Value::Float(1.25) ; "variance")]
    #[test_case(AggregateFunction::CountDistinct, Value::Integer(5) ; "count distinct")]
    #[test_case(AggregateFunction::Count, Value::Integer(4) ; "count present")]
    fn test_numeric_aggregates(func: AggregateFunction, expected: Value) {
        let mut values = ints(&[3, 1, 4, 2]);
        values.push(Value::Missing);
        assert_eq!(run(func, DataType::Integer, &values), expected);
    }

    #[test]
    fn test_empty_group_results() {
        assert_eq!(run(AggregateFunction::Sum, DataType::Integer, &[]), Value::Integer(0));
        assert_eq!(run(AggregateFunction::Sum, DataType::Float, &[]), Value::Float(0.0));
        assert_eq!(run(AggregateFunction::Mean, DataType::Float, &[]), Value::Missing);
        assert_eq!(run(AggregateFunction::Max, DataType::Float, &[]), Value::Missing);
        assert_eq!(run(AggregateFunction::Stdv, DataType::Float, &[]), Value::Float(0.0));
        assert_eq!(run(AggregateFunction::List, DataType::Float, &[]), Value::List(vec![]));
    }

    #[test]
    fn test_collection_aggregates_keep_first_appearance_order() {
        let values = vec![Value::from("b"), Value::from("a"), Value::from("b"), Value::Missing];
        assert_eq!(
            run(AggregateFunction::Distinct, DataType::String, &values),
            Value::List(vec![Value::from("b"), Value::from("a"), Value::Missing])
        );
        assert_eq!(
            run(AggregateFunction::FrequencyCount, DataType::String, &values),
            Value::Dict(vec![
                (Value::from("b"), Value::Integer(2)),
                (Value::from("a"), Value::Integer(1)),
            ])
        );
        assert_eq!(
            run(AggregateFunction::List, DataType::String, &values),
            Value::List(vec![Value::from("b"), Value::from("a"), Value::from("b")])
        );
        assert_eq!(run(AggregateFunction::SelectOne, DataType::String, &values), Value::from("b"));
    }

    #[test]
    fn test_argmax_and_quantiles() {
        let mut acc = AggregateFunction::ArgMax { value: "name".into() }.accumulator(Some(DataType::Float));
        for (score, name) in [(1.0, "x"), (7.5, "y"), (7.5, "z"), (2.0, "w")] {
            acc.update(&Value::Float(score), &Value::from(name)).unwrap();
        }
        assert_eq!(acc.finish(), Value::from("y"));

        let q = run(
            AggregateFunction::Quantile(vec![0.0, 0.5, 1.0]),
            DataType::Integer,
            &ints(&[5, 1, 3, 2, 4]),
        );
        assert_eq!(q, Value::List(vec![Value::Float(1.0), Value::Float(3.0), Value::Float(5.0)]));
    }

    #[test]
    fn test_output_types_validated() {
        let schema = Arc::new(
            Schema::new(vec![
                Field::new("s", DataType::String),
                Field::new("n", DataType::Integer),
            ])
            .unwrap(),
        );
        let sum = AggregateExpr::new(AggregateFunction::Sum, "s", "total");
        assert!(matches!(sum.output_type(&schema), Err(Error::TypeMismatch { .. })));
        let arg = AggregateExpr::new(AggregateFunction::ArgMin { value: "s".into() }, "n", "who");
        assert_eq!(arg.output_type(&schema).unwrap(), DataType::String);
        assert_eq!(arg.columns(), vec!["n", "s"]);
        let bad_q = AggregateExpr::new(AggregateFunction::Quantile(vec![1.5]), "n", "q");
        assert!(matches!(bad_q.output_type(&schema), Err(Error::InvalidArgument(_))));
        assert_eq!(AggregateExpr::count("c").output_type(&schema).unwrap(), DataType::Integer);
    }
}
