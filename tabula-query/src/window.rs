//! Rolling and cumulative window aggregates

use std::fmt;

use tabula_core::{DataType, Error, Result, Value};

use crate::expr::compare_values;

/// Function applied to each window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowFunction {
    /// Sum of present values
    Sum,
    /// Mean of present values
    Mean,
    /// Smallest present value
    Min,
    /// Largest present value
    Max,
    /// Number of present values
    Count,
    /// Population variance
    Variance,
    /// Population standard deviation
    Stdv,
}

impl WindowFunction {
    /// Output type for an input of type `input`
    pub fn output_type(self, input: DataType) -> Result<DataType> {
        let numeric = input.is_numeric() || input == DataType::Dynamic;
        match self {
            WindowFunction::Count => Ok(DataType::Integer),
            WindowFunction::Sum | WindowFunction::Min | WindowFunction::Max if numeric => Ok(input),
            WindowFunction::Mean | WindowFunction::Variance | WindowFunction::Stdv if numeric => {
                Ok(DataType::Float)
            }
            _ => Err(Error::type_mismatch(&DataType::Float, input)),
        }
    }

    fn apply(self, window: &[Value]) -> Value {
        let present = window.iter().filter(|v| !v.is_missing());
        match self {
            WindowFunction::Count => Value::Integer(present.count() as i64),
            WindowFunction::Sum => {
                let mut int = 0i64;
                let mut float = 0.0;
                let mut is_float = false;
                for v in present {
                    match v {
                        Value::Integer(i) => {
                            int = int.wrapping_add(*i);
                            float += *i as f64;
                        }
                        other => {
                            is_float = true;
                            float += other.as_f64().unwrap_or(f64::NAN);
                        }
                    }
                }
                if is_float {
                    Value::Float(float)
                } else {
                    Value::Integer(int)
                }
            }
            WindowFunction::Min => present.min_by(|a, b| compare_values(a, b)).cloned().unwrap_or_default(),
            WindowFunction::Max => present
                .fold(None::<&Value>, |best, v| match best {
                    Some(b) if compare_values(v, b).is_le() => Some(b),
                    _ => Some(v),
                })
                .cloned()
                .unwrap_or_default(),
            WindowFunction::Mean | WindowFunction::Variance | WindowFunction::Stdv => {
                let xs: Vec<f64> = present.filter_map(Value::as_f64).collect();
                if xs.is_empty() {
                    return Value::Missing;
                }
                let n = xs.len() as f64;
                let mean = xs.iter().sum::<f64>() / n;
                if self == WindowFunction::Mean {
                    return Value::Float(mean);
                }
                let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
                Value::Float(if self == WindowFunction::Stdv { var.sqrt() } else { var })
            }
        }
    }
}

impl fmt::Display for WindowFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WindowFunction::Sum => "sum",
            WindowFunction::Mean => "mean",
            WindowFunction::Min => "min",
            WindowFunction::Max => "max",
            WindowFunction::Count => "count",
            WindowFunction::Variance => "var",
            WindowFunction::Stdv => "stdv",
        };
        f.write_str(s)
    }
}

/// Rows a window covers, relative to the current row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFrame {
    /// Rows `i + start ..= i + end`. Rows outside the column count as
    /// missing. The result is missing unless at least `min_observations`
    /// values are present; `None` requires the whole window.
    Rolling {
        /// First row offset, usually negative
        start: i64,
        /// Last row offset
        end: i64,
        /// Present values required for a result
        min_observations: Option<usize>,
    },
    /// Rows `0 ..= i`
    Cumulative,
}

impl WindowFrame {
    /// Check the frame bounds
    pub fn validate(&self) -> Result<()> {
        if let WindowFrame::Rolling {
            start,
            end,
            min_observations,
        } = *self
        {
            if start > end {
                return Err(Error::InvalidArgument(format!(
                    "window start {} is after end {}",
                    start, end
                )));
            }
            let size = (end - start + 1) as u64;
            if let Some(min) = min_observations {
                if min as u64 > size {
                    return Err(Error::InvalidArgument(format!(
                        "min_observations {} exceeds window size {}",
                        min, size
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply `function` over every row of `values`
    pub fn compute(&self, function: WindowFunction, values: &[Value]) -> Result<Vec<Value>> {
        self.validate()?;
        if let Some(bad) = values
            .iter()
            .find(|v| !v.is_missing() && function != WindowFunction::Count && v.as_f64().is_none())
        {
            return Err(Error::type_mismatch(&DataType::Float, bad.type_name()));
        }
        match *self {
            WindowFrame::Cumulative => Ok(cumulative(function, values)),
            WindowFrame::Rolling {
                start,
                end,
                min_observations,
            } => {
                let n = values.len() as i64;
                let size = (end - start + 1) as usize;
                let required = min_observations.unwrap_or(size);
                Ok((0..n)
                    .map(|i| {
                        let lo = (i + start).clamp(0, n) as usize;
                        let hi = (i + end + 1).clamp(0, n) as usize;
                        let window = &values[lo..hi.max(lo)];
                        let present = window.iter().filter(|v| !v.is_missing()).count();
                        if function != WindowFunction::Count && present < required.max(1) {
                            Value::Missing
                        } else {
                            function.apply(window)
                        }
                    })
                    .collect())
            }
        }
    }
}

fn cumulative(function: WindowFunction, values: &[Value]) -> Vec<Value> {
    match function {
        WindowFunction::Sum | WindowFunction::Count | WindowFunction::Min | WindowFunction::Max => {
            // these fold incrementally
            let mut out = Vec::with_capacity(values.len());
            let mut state: Option<Value> = None;
            let mut count = 0i64;
            for v in values {
                if !v.is_missing() {
                    count += 1;
                    state = Some(match state.take() {
                        None => v.clone(),
                        Some(acc) => function.apply(&[acc, v.clone()]),
                    });
                }
                out.push(match function {
                    WindowFunction::Count => Value::Integer(count),
                    _ => state.clone().unwrap_or_default(),
                });
            }
            out
        }
        _ => {
            let mut n = 0f64;
            let mut mean = 0f64;
            let mut m2 = 0f64;
            values
                .iter()
                .map(|v| {
                    if let Some(x) = v.as_f64().filter(|_| !v.is_missing()) {
                        n += 1.0;
                        let delta = x - mean;
                        mean += delta / n;
                        m2 += delta * (x - mean);
                    }
                    if n == 0.0 {
                        return Value::Missing;
                    }
                    let var = m2 / n;
                    Value::Float(match function {
                        WindowFunction::Mean => mean,
                        WindowFunction::Variance => var,
                        _ => var.sqrt(),
                    })
                })
                .collect()
        }
    }
}
