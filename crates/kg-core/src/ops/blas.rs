use std::rc::Rc;

use kg_tensor::{Shape, TensorError};

use crate::config::Config;
use crate::error::{KernelError, Result};
use crate::grad::GradOutput;
use crate::graph::{Arg, Context, ResultId, Spec, Value};
use crate::op::{array_arg, array_out, DestroyMap, NativeCode, Operator};

use super::{scalar_arg, transpose};

/// Declarations used when no cblas header is configured.
const CBLAS_DECLS: &str = r#"#define CblasRowMajor 101
#define CblasColMajor 102
#define CblasNoTrans 111
#define CblasTrans 112
void cblas_sgemm(int order, int transa, int transb, int m, int n, int k,
                 float alpha, const float* a, int lda, const float* b, int ldb,
                 float beta, float* c, int ldc);
void cblas_dgemm(int order, int transa, int transb, int m, int n, int k,
                 double alpha, const double* a, int lda, const double* b, int ldb,
                 double beta, double* c, int ldc);
"#;

/// Layout classes of (x, y, z) and the matching cblas call. 0 is row-major,
/// 1 is column-major.
const DISPATCH: [(u32, &str, &str, &str, &str, &str, &str); 8] = [
    (0x000, "CblasRowMajor", "CblasNoTrans", "CblasNoTrans", "sx_0", "sy_0", "sz_0"),
    (0x001, "CblasRowMajor", "CblasTrans", "CblasNoTrans", "sx_1", "sy_0", "sz_0"),
    (0x010, "CblasRowMajor", "CblasNoTrans", "CblasTrans", "sx_0", "sy_1", "sz_0"),
    (0x011, "CblasRowMajor", "CblasTrans", "CblasTrans", "sx_1", "sy_1", "sz_0"),
    (0x100, "CblasColMajor", "CblasTrans", "CblasTrans", "sx_0", "sy_0", "sz_1"),
    (0x101, "CblasColMajor", "CblasNoTrans", "CblasTrans", "sx_1", "sy_0", "sz_1"),
    (0x110, "CblasColMajor", "CblasTrans", "CblasNoTrans", "sx_0", "sy_1", "sz_1"),
    (0x111, "CblasColMajor", "CblasNoTrans", "CblasNoTrans", "sx_1", "sy_1", "sz_1"),
];

/// `z = alpha * x . y + beta * z` through cblas, for buffers `x`, `y` and
/// `z`.
///
/// Layouts cblas cannot express and non-float or mixed dtypes return
/// `KG_UNSUPPORTED`; disagreeing dimensions return `KG_FAILED`.
fn gemm_body(alpha: &str, beta: &str) -> String {
    let mut code = String::from(
        r#"if (x->nd != 2 || y->nd != 2 || z->nd != 2) return KG_UNSUPPORTED;
if (x->dtype != z->dtype || y->dtype != z->dtype) return KG_UNSUPPORTED;
if (z->dtype != KG_DTYPE_F32 && z->dtype != KG_DTYPE_F64) return KG_UNSUPPORTED;
const int64_t* Nx = x->dims;
const int64_t* Ny = y->dims;
const int64_t* Nz = z->dims;
const int64_t* Sx = x->strides;
const int64_t* Sy = y->strides;
const int64_t* Sz = z->strides;
if (Nx[0] != Nz[0] || Nx[1] != Ny[0] || Ny[1] != Nz[1]) return KG_FAILED;
if (Nz[0] == 0 || Nz[1] == 0 || Nx[1] == 0) return KG_UNSUPPORTED;
if (Sx[0] < 1 || Sx[1] < 1 || Sy[0] < 1 || Sy[1] < 1 || Sz[0] < 1 || Sz[1] < 1) return KG_UNSUPPORTED;
int kg_unit = 0;
kg_unit |= ((Sx[1] == 1) ? 0x0 : (Sx[0] == 1) ? 0x1 : 0x2) << 0;
kg_unit |= ((Sy[1] == 1) ? 0x0 : (Sy[0] == 1) ? 0x1 : 0x2) << 4;
kg_unit |= ((Sz[1] == 1) ? 0x0 : (Sz[0] == 1) ? 0x1 : 0x2) << 8;
/* Row and column vectors get a leading dimension cblas accepts. */
const int sx_0 = (int)((Nx[0] > 1) ? Sx[0] : Nx[1]);
const int sx_1 = (int)((Nx[1] > 1) ? Sx[1] : Nx[0]);
const int sy_0 = (int)((Ny[0] > 1) ? Sy[0] : Ny[1]);
const int sy_1 = (int)((Ny[1] > 1) ? Sy[1] : Ny[0]);
const int sz_0 = (int)((Nz[0] > 1) ? Sz[0] : Nz[1]);
const int sz_1 = (int)((Nz[1] > 1) ? Sz[1] : Nz[0]);
const int M = (int)Nz[0];
const int N = (int)Nz[1];
const int K = (int)Nx[1];
"#,
    );
    for (real, prefix, tag) in [("float", 's', "KG_DTYPE_F32"), ("double", 'd', "KG_DTYPE_F64")] {
        code.push_str(&format!(
            "if (z->dtype == {tag}) {{\n\
             const {real} alpha = ({real})({alpha});\n\
             const {real} beta = ({real})({beta});\n\
             const {real}* xp = (const {real}*)x->data;\n\
             const {real}* yp = (const {real}*)y->data;\n\
             {real}* zp = ({real}*)z->data;\n\
             switch (kg_unit) {{\n"
        ));
        for (unit, order, ta, tb, lda, ldb, ldc) in DISPATCH {
            code.push_str(&format!(
                "case 0x{unit:03x}: cblas_{prefix}gemm({order}, {ta}, {tb}, M, N, K, alpha, xp, {lda}, yp, {ldb}, beta, zp, {ldc}); break;\n"
            ));
        }
        code.push_str("default: return KG_UNSUPPORTED;\n}\nreturn KG_OK;\n}\n");
    }
    code.push_str("return KG_UNSUPPORTED;\n");
    code
}

fn blas_headers(config: &Config) -> Vec<String> {
    config.cblas_header.iter().cloned().collect()
}

fn blas_support(config: &Config) -> String {
    match config.cblas_header {
        Some(_) => String::new(),
        None => CBLAS_DECLS.to_string(),
    }
}

fn matrix_spec<'a>(op: &str, spec: &'a Option<Spec>) -> Result<(kg_tensor::DType, &'a Shape)> {
    match spec {
        Some(Spec::Array { dtype, shape }) if shape.ndim() == 2 => Ok((*dtype, shape)),
        Some(Spec::Array { shape, .. }) => Err(KernelError::ShapeOrDtypeUnresolved {
            op: op.to_string(),
            reason: format!("expected a matrix, got shape {shape}"),
        }),
        _ => Err(KernelError::ShapeOrDtypeUnresolved {
            op: op.to_string(),
            reason: "expected an array with a known spec".to_string(),
        }),
    }
}

/// Matrix product of two matrices.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dot;

impl Operator for Dot {
    fn name(&self) -> String {
        "dot".to_string()
    }

    fn specs(&self, inputs: &[Option<Spec>]) -> Result<Vec<Option<Spec>>> {
        let [x, y] = inputs else {
            return Err(KernelError::ShapeOrDtypeUnresolved {
                op: self.name(),
                reason: format!("expected 2 inputs, got {}", inputs.len()),
            });
        };
        let (xd, xs) = matrix_spec("dot", x)?;
        let (yd, ys) = matrix_spec("dot", y)?;
        if xs.dim(1) != ys.dim(0) {
            return Err(TensorError::MatmulMismatch {
                m: xs.dim(0),
                k: xs.dim(1),
                k2: ys.dim(0),
                n: ys.dim(1),
            }
            .into());
        }
        Ok(vec![Some(Spec::array(xd.join(yd), vec![xs.dim(0), ys.dim(1)]))])
    }

    fn perform(&self, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
        let x = array_arg("dot", inputs, 0)?;
        let y = array_arg("dot", inputs, 1)?;
        array_out("dot", outputs, 0)?.assign(&x.matmul(y)?)?;
        Ok(())
    }

    fn grad(&self, ctx: &mut Context, inputs: &[ResultId], gz: &[ResultId]) -> Result<GradOutput> {
        let (x, y) = (inputs[0], inputs[1]);
        let yt = transpose(ctx, y)?;
        let gx = dot(ctx, gz[0], yt)?;
        let xt = transpose(ctx, x)?;
        let gy = dot(ctx, xt, gz[0])?;
        Ok(GradOutput::values(&[gx, gy]))
    }

    fn c_code(&self) -> Option<NativeCode> {
        Some(NativeCode {
            params: vec!["x".into(), "y".into(), "z".into()],
            body: gemm_body("1.0", "0.0"),
        })
    }

    fn c_support_code(&self, config: &Config) -> String {
        blas_support(config)
    }

    fn c_headers(&self, config: &Config) -> Vec<String> {
        blas_headers(config)
    }

    fn c_libs(&self, config: &Config) -> Vec<String> {
        config.blas_libs.clone()
    }
}

pub fn dot(ctx: &mut Context, x: impl Into<Arg>, y: impl Into<Arg>) -> Result<ResultId> {
    ctx.apply1(Rc::new(Dot), &[x.into(), y.into()])
}

/// `z = b * z + a * x . y`, written into `z`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gemm;

impl Operator for Gemm {
    fn name(&self) -> String {
        "gemm".to_string()
    }

    fn destroy_map(&self) -> DestroyMap {
        DestroyMap::from([(0, 0)])
    }

    fn specs(&self, inputs: &[Option<Spec>]) -> Result<Vec<Option<Spec>>> {
        let [z, _a, x, y, _b] = inputs else {
            return Err(KernelError::ShapeOrDtypeUnresolved {
                op: self.name(),
                reason: format!("expected 5 inputs, got {}", inputs.len()),
            });
        };
        let (_, zs) = matrix_spec("gemm", z)?;
        let (_, xs) = matrix_spec("gemm", x)?;
        let (_, ys) = matrix_spec("gemm", y)?;
        if xs.dim(1) != ys.dim(0) || xs.dim(0) != zs.dim(0) || ys.dim(1) != zs.dim(1) {
            return Err(TensorError::MatmulMismatch {
                m: xs.dim(0),
                k: xs.dim(1),
                k2: ys.dim(0),
                n: ys.dim(1),
            }
            .into());
        }
        Ok(vec![z.clone()])
    }

    fn perform(&self, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<()> {
        let a = scalar_arg("gemm", inputs, 1)?;
        let b = scalar_arg("gemm", inputs, 4)?;
        let x = array_arg("gemm", inputs, 2)?;
        let y = array_arg("gemm", inputs, 3)?;
        let z = array_out("gemm", outputs, 0)?;
        let product = x.matmul(y)?.to_vec_f64();
        let values: Vec<f64> = z
            .to_vec_f64()
            .into_iter()
            .zip(product)
            .map(|(zv, p)| b * zv + a * p)
            .collect();
        z.write_f64(&values)?;
        Ok(())
    }

    fn grad(&self, _: &mut Context, inputs: &[ResultId], _: &[ResultId]) -> Result<GradOutput> {
        Ok(GradOutput::undefined(inputs.len()))
    }

    fn c_code(&self) -> Option<NativeCode> {
        Some(NativeCode {
            params: ["zin", "a", "x", "y", "b", "z"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            body: gemm_body("a_data[0]", "b_data[0]"),
        })
    }

    fn c_support_code(&self, config: &Config) -> String {
        blas_support(config)
    }

    fn c_headers(&self, config: &Config) -> Vec<String> {
        blas_headers(config)
    }

    fn c_libs(&self, config: &Config) -> Vec<String> {
        config.blas_libs.clone()
    }
}

pub fn gemm(
    ctx: &mut Context,
    z: impl Into<Arg>,
    a: impl Into<Arg>,
    x: impl Into<Arg>,
    y: impl Into<Arg>,
    b: impl Into<Arg>,
) -> Result<ResultId> {
    ctx.apply1(
        Rc::new(Gemm),
        &[z.into(), a.into(), x.into(), y.into(), b.into()],
    )
}
