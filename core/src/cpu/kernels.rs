//! Reference kernels. Arithmetic is carried out in `f64` and cast back to
//! the operand type.

use crate::buffer::{Buffer, DType};

/// Below this many multiply-adds a MatMul stays on the calling thread.
const PARALLEL_MIN_WORK: usize = 1 << 16;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Unary {
    Relu,
    Sigmoid,
    Tanh,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Binary {
    Add,
    Sub,
    Mul,
}

fn require_numeric(x: &Buffer, op: &str) -> Result<(), String> {
    if x.dtype() == DType::Bool {
        return Err(format!("{op} does not support bool operands"));
    }
    Ok(())
}

fn require_float(x: &Buffer, op: &str) -> Result<(), String> {
    if !x.dtype().is_float() {
        return Err(format!("{op} needs a float operand, got {}", x.dtype()));
    }
    Ok(())
}

pub(crate) fn unary(x: &Buffer, op: Unary) -> Result<Buffer, String> {
    let values = x.to_f64_vec();
    let values: Vec<f64> = match op {
        Unary::Relu => {
            require_numeric(x, "Relu")?;
            values.into_iter().map(|v| v.max(0.0)).collect()
        }
        Unary::Sigmoid => {
            require_float(x, "Sigmoid")?;
            values.into_iter().map(|v| 1.0 / (1.0 + (-v).exp())).collect()
        }
        Unary::Tanh => {
            require_float(x, "Tanh")?;
            values.into_iter().map(f64::tanh).collect()
        }
    };
    Ok(Buffer::from_f64(x.dtype(), x.shape().to_vec(), values))
}

/// Element-wise binary op with numpy-style broadcasting.
pub(crate) fn binary(a: &Buffer, b: &Buffer, op: Binary) -> Result<Buffer, String> {
    let name = match op {
        Binary::Add => "Add",
        Binary::Sub => "Sub",
        Binary::Mul => "Mul",
    };
    require_numeric(a, name)?;
    if a.dtype() != b.dtype() {
        return Err(format!("{name} operands differ in type: {} vs {}", a.dtype(), b.dtype()));
    }
    let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(|| {
        format!(
            "{name} cannot broadcast shapes {:?} and {:?}",
            a.shape(),
            b.shape()
        )
    })?;

    let rank = shape.len();
    let sa = broadcast_strides(a.shape(), rank);
    let sb = broadcast_strides(b.shape(), rank);
    let xa = a.to_f64_vec();
    let xb = b.to_f64_vec();

    let total: usize = shape.iter().product();
    let mut idx = vec![0usize; rank];
    let mut values = Vec::with_capacity(total);
    for _ in 0..total {
        let oa: usize = idx.iter().zip(&sa).map(|(i, s)| i * s).sum();
        let ob: usize = idx.iter().zip(&sb).map(|(i, s)| i * s).sum();
        let (x, y) = (xa[oa], xb[ob]);
        values.push(match op {
            Binary::Add => x + y,
            Binary::Sub => x - y,
            Binary::Mul => x * y,
        });
        for d in (0..rank).rev() {
            idx[d] += 1;
            if idx[d] < shape[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    Ok(Buffer::from_f64(a.dtype(), shape, values))
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |s: &[usize], i: usize| {
        let pad = rank - s.len();
        if i < pad { 1 } else { s[i - pad] }
    };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

/// Row-major strides of `shape` aligned to `rank` axes, 0 on broadcast axes.
fn broadcast_strides(shape: &[usize], rank: usize) -> Vec<usize> {
    let pad = rank - shape.len();
    let mut strides = vec![0; rank];
    let mut acc = 1;
    for i in (0..shape.len()).rev() {
        strides[pad + i] = if shape[i] == 1 { 0 } else { acc };
        acc *= shape[i];
    }
    strides
}

/// `[m, k] x [k, n]`. Rows are split across up to `threads` scoped threads
/// when the product is large enough.
pub(crate) fn matmul(a: &Buffer, b: &Buffer, threads: usize) -> Result<Buffer, String> {
    require_numeric(a, "MatMul")?;
    if a.dtype() != b.dtype() {
        return Err(format!("MatMul operands differ in type: {} vs {}", a.dtype(), b.dtype()));
    }
    let (&[m, k], &[k2, n]) = (a.shape(), b.shape()) else {
        return Err(format!(
            "MatMul needs two matrices, got shapes {:?} and {:?}",
            a.shape(),
            b.shape()
        ));
    };
    if k != k2 {
        return Err(format!(
            "MatMul inner dimensions differ: {:?} x {:?}",
            a.shape(),
            b.shape()
        ));
    }

    let xa = a.to_f64_vec();
    let xb = b.to_f64_vec();
    let mut out = vec![0.0f64; m * n];

    let fill_rows = |chunk: &mut [f64], first_row: usize| {
        for (r, row) in chunk.chunks_mut(n).enumerate() {
            let i = first_row + r;
            for p in 0..k {
                let av = xa[i * k + p];
                let brow = &xb[p * n..(p + 1) * n];
                for (o, &bv) in row.iter_mut().zip(brow) {
                    *o += av * bv;
                }
            }
        }
    };

    let threads = threads.clamp(1, m.max(1));
    if threads > 1 && n > 0 && m * n * k >= PARALLEL_MIN_WORK {
        let per = m.div_ceil(threads);
        std::thread::scope(|s| {
            for (t, chunk) in out.chunks_mut(per * n).enumerate() {
                let fill_rows = &fill_rows;
                s.spawn(move || fill_rows(chunk, t * per));
            }
        });
    } else if n > 0 {
        fill_rows(&mut out, 0);
    }

    Ok(Buffer::from_f64(a.dtype(), vec![m, n], out))
}

/// Softmax over the last axis.
pub(crate) fn softmax(x: &Buffer) -> Result<Buffer, String> {
    require_float(x, "Softmax")?;
    let Some(&last) = x.shape().last() else {
        return Err("Softmax needs rank >= 1".into());
    };
    let mut values = x.to_f64_vec();
    if last > 0 {
        for row in values.chunks_mut(last) {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
    }
    Ok(Buffer::from_f64(x.dtype(), x.shape().to_vec(), values))
}

/// Splits the last axis into `num` equal parts.
pub(crate) fn split(x: &Buffer, num: usize) -> Result<Vec<Buffer>, String> {
    let Some(&last) = x.shape().last() else {
        return Err("Split needs rank >= 1".into());
    };
    if num == 0 || last % num != 0 {
        return Err(format!("Split cannot divide extent {last} into {num} parts"));
    }
    let part = last / num;
    let mut shape = x.shape().to_vec();
    if let Some(l) = shape.last_mut() {
        *l = part;
    }

    let values = x.to_f64_vec();
    let mut parts: Vec<Vec<f64>> = vec![Vec::with_capacity(values.len() / num); num];
    if last > 0 {
        for row in values.chunks(last) {
            for (i, seg) in row.chunks(part.max(1)).enumerate().take(num) {
                parts[i].extend_from_slice(seg);
            }
        }
    }
    Ok(parts
        .into_iter()
        .map(|p| Buffer::from_f64(x.dtype(), shape.clone(), p))
        .collect())
}
