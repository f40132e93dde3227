use std::fmt::Write as _;

use kg_tensor::{DType, Tensor};
use sha2::{Digest, Sha256};

use crate::op::NativeCode;

/// Placeholder for the unit name while the unit body is hashed.
const UNIT: &str = "@UNIT@";

/// Runtime condition selecting the flat-pointer loop.
const CONTIGUOUS_TEST: &str = "kg_path == KG_PATH_AUTO && (kg_all_c || kg_all_f)";

/// Buffer ABI, status codes and cursor helpers shared by every unit.
pub const PRELUDE: &str = r#"#include <stddef.h>
#include <stdint.h>
#include <stdlib.h>
#include <string.h>
#include <math.h>

#if defined(_WIN32)
#define KG_EXPORT __declspec(dllexport)
#else
#define KG_EXPORT
#endif

#define KG_OK 0
#define KG_UNSUPPORTED 1
#define KG_FAILED 2

#define KG_PATH_AUTO 0
#define KG_PATH_GENERAL 1

#define KG_MAX_DIMS 32

#define KG_DTYPE_F16 1
#define KG_DTYPE_F32 2
#define KG_DTYPE_F64 3
#define KG_DTYPE_I32 4
#define KG_DTYPE_I64 5

/* Strides count elements, not bytes. data points at the first element. */
typedef struct {
    void* data;
    int64_t nd;
    const int64_t* dims;
    const int64_t* strides;
    int32_t dtype;
} kg_buffer;

static int64_t kg_numel(const kg_buffer* b) {
    int64_t n = 1;
    for (int64_t k = 0; k < b->nd; ++k) n *= b->dims[k];
    return n;
}

static int kg_is_c_contiguous(const kg_buffer* b) {
    int64_t expected = 1;
    if (kg_numel(b) == 0) return 1;
    for (int64_t k = b->nd - 1; k >= 0; --k) {
        if (b->dims[k] == 1) continue;
        if (b->strides[k] != expected) return 0;
        expected *= b->dims[k];
    }
    return 1;
}

static int kg_is_f_contiguous(const kg_buffer* b) {
    int64_t expected = 1;
    if (kg_numel(b) == 0) return 1;
    for (int64_t k = 0; k < b->nd; ++k) {
        if (b->dims[k] == 1) continue;
        if (b->strides[k] != expected) return 0;
        expected *= b->dims[k];
    }
    return 1;
}

/* Walks a buffer in row-major logical order, following its own strides. */
typedef struct {
    char* ptr;
    int64_t nd;
    int64_t elsize;
    const int64_t* dims;
    const int64_t* strides;
    int64_t index[KG_MAX_DIMS];
} kg_cursor;

static void kg_cursor_init(kg_cursor* c, const kg_buffer* b, int64_t elsize) {
    c->ptr = (char*)b->data;
    c->nd = b->nd;
    c->elsize = elsize;
    c->dims = b->dims;
    c->strides = b->strides;
    for (int64_t k = 0; k < c->nd; ++k) c->index[k] = 0;
}

static void kg_cursor_next(kg_cursor* c) {
    for (int64_t k = c->nd - 1; k >= 0; --k) {
        c->index[k] += 1;
        c->ptr += c->strides[k] * c->elsize;
        if (c->index[k] < c->dims[k]) return;
        c->ptr -= c->strides[k] * c->dims[k] * c->elsize;
        c->index[k] = 0;
    }
}
"#;

/// Iteration strategy requested when a thunk is bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LoopPath {
    /// Flat pointer loops when every loop array shares one layout, strided
    /// cursors otherwise.
    #[default]
    Auto,
    /// Always use strided cursors.
    General,
}

impl LoopPath {
    /// Value passed to `<unit>_instantiate`.
    pub fn code(self) -> i32 {
        match self {
            LoopPath::Auto => 0,
            LoopPath::General => 1,
        }
    }
}

/// A generated translation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelUnit {
    /// C identifier prefixing the lifecycle entry points.
    pub name: String,
    /// SHA-256 of the unit body, hex encoded.
    pub hash: String,
    /// Complete C source.
    pub source: String,
}

impl KernelUnit {
    pub fn instantiate_symbol(&self) -> String {
        format!("{}_instantiate", self.name)
    }

    pub fn execute_symbol(&self) -> String {
        format!("{}_execute", self.name)
    }

    pub fn destroy_symbol(&self) -> String {
        format!("{}_destroy", self.name)
    }
}

/// C element type of a dtype. Half precision has no portable C type.
pub fn c_type(dtype: DType) -> Option<&'static str> {
    match dtype {
        DType::F16 => None,
        DType::F32 => Some("float"),
        DType::F64 => Some("double"),
        DType::I32 => Some("int32_t"),
        DType::I64 => Some("int64_t"),
    }
}

pub fn dtypes_of(buffers: &[Tensor]) -> Vec<DType> {
    buffers.iter().map(Tensor::dtype).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    out.trim_matches('_').to_string()
}

fn include_line(header: &str) -> String {
    if header.starts_with('<') || header.starts_with('"') {
        format!("#include {header}\n")
    } else {
        format!("#include <{header}>\n")
    }
}

/// Wrap an operator body into a lifecycle unit bound to buffers of
/// `dtypes`.
///
/// Returns `None` when a dtype has no C element type.
pub fn generate_unit(
    op_name: &str,
    native: &NativeCode,
    dtypes: &[DType],
    headers: &[String],
    support: &str,
) -> Option<KernelUnit> {
    if native.params.len() != dtypes.len() {
        return None;
    }

    let mut body = String::new();
    for (name, dtype) in native.params.iter().zip(dtypes) {
        let ty = c_type(*dtype)?;
        let _ = writeln!(body, "typedef {ty} {name}_dtype;");
    }
    body.push('\n');
    body.push_str(support);
    body.push('\n');

    let _ = writeln!(body, "struct {UNIT} {{");
    for name in &native.params {
        let _ = writeln!(body, "    kg_buffer {name};");
    }
    body.push_str("    int32_t path;\n};\n\n");

    let n = native.params.len();
    let _ = writeln!(
        body,
        "KG_EXPORT void* {UNIT}_instantiate(const kg_buffer* bufs, int64_t n, int32_t path) {{"
    );
    let _ = writeln!(body, "    if (n != {n}) return NULL;");
    let _ = writeln!(
        body,
        "    struct {UNIT}* self = (struct {UNIT}*)malloc(sizeof(struct {UNIT}));"
    );
    body.push_str("    if (self == NULL) return NULL;\n");
    for (i, name) in native.params.iter().enumerate() {
        let _ = writeln!(body, "    self->{name} = bufs[{i}];");
    }
    body.push_str("    self->path = path;\n    return self;\n}\n\n");

    let _ = writeln!(body, "KG_EXPORT int32_t {UNIT}_execute(void* handle) {{");
    let _ = writeln!(body, "    struct {UNIT}* self = (struct {UNIT}*)handle;");
    body.push_str("    const int32_t kg_path = self->path;\n");
    for name in &native.params {
        let _ = writeln!(body, "    const kg_buffer* {name} = &self->{name};");
        let _ = writeln!(
            body,
            "    {name}_dtype* {name}_data = ({name}_dtype*){name}->data;"
        );
    }
    body.push_str("    (void)kg_path;\n");
    for name in &native.params {
        let _ = writeln!(body, "    (void){name};");
        let _ = writeln!(body, "    (void){name}_data;");
    }
    body.push_str("    {\n");
    push_indented(&mut body, &native.body, 2);
    body.push_str("    }\n    return KG_OK;\n}\n\n");

    let _ = writeln!(body, "KG_EXPORT void {UNIT}_destroy(void* handle) {{");
    body.push_str("    free(handle);\n}\n");

    let hash = sha256_hex(body.as_bytes());
    let name = format!("kg_{}_{}", sanitize(op_name), &hash[..16]);

    let mut source = String::from(PRELUDE);
    source.push('\n');
    for header in headers {
        source.push_str(&include_line(header));
    }
    source.push('\n');
    source.push_str(&body.replace(UNIT, &name));

    Some(KernelUnit { name, hash, source })
}

fn push_indented(out: &mut String, block: &str, level: usize) {
    let pad = "    ".repeat(level);
    for line in block.lines() {
        if line.trim().is_empty() {
            out.push('\n');
        } else if line.starts_with('#') {
            // Preprocessor lines stay in column zero.
            out.push_str(line);
            out.push('\n');
        } else {
            out.push_str(&pad);
            out.push_str(line.trim_start());
            out.push('\n');
        }
    }
}

/// Loop variables of an elementwise body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopVars {
    /// Loop inputs that get their own cursor.
    pub inputs: Vec<String>,
    /// Loop outputs, written through `<name>_i`.
    pub outputs: Vec<String>,
    /// Destroyed loop inputs and the output they are read through.
    pub aliases: Vec<(String, String)>,
}

impl LoopVars {
    fn bound(&self) -> impl Iterator<Item = &String> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

/// Synthesize an elementwise execute body with both iteration strategies.
///
/// The contiguous path walks flat pointers and is taken when every loop
/// array is C-contiguous or every one is F-contiguous and the path is
/// `Auto`. The general path walks one strided cursor per array. An aliased
/// input is read from its output binding, so the shared storage has a
/// single cursor.
pub fn elemwise_body(vars: &LoopVars, init: &str, foreach: &str, finalize: &str) -> String {
    let mut code = String::new();
    let Some(first) = vars.bound().next() else {
        code.push_str(init);
        code.push('\n');
        code.push_str(finalize);
        code.push('\n');
        return code;
    };

    let _ = writeln!(code, "const int64_t kg_count = kg_numel({first});");
    for name in vars.bound().skip(1) {
        let _ = writeln!(code, "if (kg_numel({name}) != kg_count) return KG_FAILED;");
    }
    let _ = writeln!(code, "int kg_all_c = 1;");
    let _ = writeln!(code, "int kg_all_f = 1;");
    for name in vars.bound() {
        let _ = writeln!(code, "kg_all_c &= kg_is_c_contiguous({name});");
        let _ = writeln!(code, "kg_all_f &= kg_is_f_contiguous({name});");
    }
    let contiguous = CONTIGUOUS_TEST;
    let fits = vars
        .bound()
        .map(|name| format!("{name}->nd <= KG_MAX_DIMS"))
        .collect::<Vec<_>>()
        .join(" && ");
    let _ = writeln!(
        code,
        "if (!({contiguous}) && !({fits})) return KG_UNSUPPORTED;"
    );

    code.push_str(init);
    code.push('\n');

    let _ = writeln!(code, "if ({contiguous}) {{");
    for name in vars.bound() {
        let _ = writeln!(code, "{name}_dtype* {name}_ptr = {name}_data;");
    }
    code.push_str(&loop_block(
        vars,
        foreach,
        |name| format!("(*{name}_ptr)"),
        |name| format!("++{name}_ptr;"),
    ));
    code.push_str("} else {\n");
    for name in vars.bound() {
        let _ = writeln!(code, "kg_cursor {name}_cur;");
        let _ = writeln!(
            code,
            "kg_cursor_init(&{name}_cur, {name}, (int64_t)sizeof({name}_dtype));"
        );
    }
    code.push_str(&loop_block(
        vars,
        foreach,
        |name| format!("(*({name}_dtype*){name}_cur.ptr)"),
        |name| format!("kg_cursor_next(&{name}_cur);"),
    ));
    code.push_str("}\n");

    code.push_str(finalize);
    code.push('\n');
    code
}

fn loop_block<A, N>(vars: &LoopVars, foreach: &str, access: A, next: N) -> String
where
    A: Fn(&str) -> String,
    N: Fn(&str) -> String,
{
    let mut code = String::new();
    code.push_str("for (int64_t kg_n = 0; kg_n < kg_count; ++kg_n) {\n");
    for name in &vars.inputs {
        let _ = writeln!(code, "const {name}_dtype {name}_i = {};", access(name));
    }
    for name in &vars.outputs {
        let _ = writeln!(code, "#define {name}_i {}", access(name));
    }
    for (input, output) in &vars.aliases {
        let _ = writeln!(code, "const {input}_dtype {input}_i = {output}_i;");
    }
    code.push_str("{\n");
    code.push_str(foreach);
    code.push_str("\n}\n");
    for name in &vars.outputs {
        let _ = writeln!(code, "#undef {name}_i");
    }
    for name in vars.bound() {
        code.push_str(&next(name));
        code.push('\n');
    }
    code.push_str("}\n");
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_vars() -> LoopVars {
        LoopVars {
            inputs: vec!["x".into(), "y".into()],
            outputs: vec!["z".into()],
            aliases: Vec::new(),
        }
    }

    fn add_code() -> NativeCode {
        NativeCode {
            params: vec!["x".into(), "y".into(), "z".into()],
            body: elemwise_body(&add_vars(), "", "z_i = x_i + y_i;", ""),
        }
    }

    #[test]
    fn test_c_types() {
        assert_eq!(c_type(DType::F64), Some("double"));
        assert_eq!(c_type(DType::I32), Some("int32_t"));
        assert_eq!(c_type(DType::F16), None);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("add_elemwise_inplace{0: 1}"), "add_elemwise_inplace_0_1");
        assert_eq!(sanitize("neg"), "neg");
    }

    #[test]
    fn test_elemwise_body_has_both_paths() {
        let body = elemwise_body(&add_vars(), "", "z_i = x_i + y_i;", "");
        assert!(body.contains("kg_is_c_contiguous(x)"));
        assert!(body.contains("kg_is_f_contiguous(z)"));
        assert!(body.contains("(*x_ptr)"));
        assert!(body.contains("kg_cursor_next(&y_cur);"));
        assert!(body.contains("#define z_i"));
        assert!(body.contains("#undef z_i"));
    }

    #[test]
    fn test_alias_is_read_through_output() {
        let vars = LoopVars {
            inputs: vec!["y".into()],
            outputs: vec!["z".into()],
            aliases: vec![("x".into(), "z".into())],
        };
        let body = elemwise_body(&vars, "", "z_i = x_i + y_i;", "");
        assert!(body.contains("const x_dtype x_i = z_i;"));
        assert!(!body.contains("x_cur"));
        assert!(!body.contains("x_ptr"));
    }

    #[test]
    fn test_unit_is_content_addressed() {
        let code = add_code();
        let f64s = [DType::F64; 3];
        let a = generate_unit("add_elemwise", &code, &f64s, &[], "").unwrap();
        let b = generate_unit("add_elemwise", &code, &f64s, &[], "").unwrap();
        assert_eq!(a, b);
        assert!(a.name.starts_with("kg_add_elemwise_"));
        assert_eq!(a.name.len(), "kg_add_elemwise_".len() + 16);
        assert!(a.source.contains(&a.instantiate_symbol()));
        assert!(a.source.contains(&a.execute_symbol()));
        assert!(a.source.contains(&a.destroy_symbol()));
        assert!(!a.source.contains(UNIT));

        let f32s = [DType::F32; 3];
        let c = generate_unit("add_elemwise", &code, &f32s, &[], "").unwrap();
        assert_ne!(a.hash, c.hash);
        assert!(c.source.contains("typedef float x_dtype;"));
    }

    #[test]
    fn test_half_precision_is_not_generated() {
        let code = add_code();
        let dtypes = [DType::F16, DType::F64, DType::F64];
        assert!(generate_unit("add_elemwise", &code, &dtypes, &[], "").is_none());
    }

    #[test]
    fn test_headers_are_included() {
        let code = add_code();
        let headers = vec!["cblas.h".to_string(), "\"local.h\"".to_string()];
        let unit = generate_unit("dot", &code, &[DType::F64; 3], &headers, "").unwrap();
        assert!(unit.source.contains("#include <cblas.h>"));
        assert!(unit.source.contains("#include \"local.h\""));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
