use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub decorators: Vec<Expr>,
    #[serde(default)]
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    #[serde(default)]
    pub bases: Vec<Expr>,
    #[serde(default)]
    pub keywords: Vec<Keyword>,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub decorators: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub default: Option<Expr>,
}

impl Param {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptHandler {
    #[serde(default)]
    pub typ: Option<Expr>,
    #[serde(default)]
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportAlias {
    pub name: String,
    #[serde(default)]
    pub asname: Option<String>,
}

impl ImportAlias {
    /// The name the import statement binds in the enclosing scope.
    pub fn bound_name(&self) -> &str {
        match &self.asname {
            Some(asname) => asname,
            None => self.name.split('.').next().unwrap_or(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    FunctionDef(FunctionDef),
    ClassDef(ClassDef),
    Assign { targets: Vec<Expr>, value: Expr },
    AugAssign { target: Expr, op: BinOpKind, value: Expr },
    Return(Option<Expr>),
    Expr(Expr),
    If { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    While { test: Expr, body: Vec<Stmt> },
    For { target: Expr, iter: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    Try { body: Vec<Stmt>, handlers: Vec<ExceptHandler>, orelse: Vec<Stmt>, finalbody: Vec<Stmt> },
    Raise(Option<Expr>),
    Import { names: Vec<ImportAlias> },
    ImportFrom { module: String, names: Vec<ImportAlias> },
    Delete { targets: Vec<Expr> },
    Global { names: Vec<String> },
    Nonlocal { names: Vec<String> },
    Pass,
    Break,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ctx {
    Load,
    Store,
    Del,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    /// `None` is a `**kwargs` splat.
    pub arg: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOpKind {
    Add,
    Sub,
    Mult,
    Div,
    FloorDiv,
    Mod,
    Pow,
    BitXor,
    BitAnd,
    BitOr,
    LShift,
    RShift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOpKind {
    Not,
    USub,
    UAdd,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOpKind {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOpKind {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Name { id: String, ctx: Ctx },
    Literal(Literal),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Dict { keys: Vec<Expr>, values: Vec<Expr> },
    Attribute { value: Box<Expr>, attr: String, ctx: Ctx },
    Subscript { value: Box<Expr>, index: Box<Expr> },
    Call { func: Box<Expr>, args: Vec<Expr>, keywords: Vec<Keyword> },
    BinOp { left: Box<Expr>, op: BinOpKind, right: Box<Expr> },
    UnaryOp { op: UnaryOpKind, operand: Box<Expr> },
    BoolOp { op: BoolOpKind, values: Vec<Expr> },
    Compare { left: Box<Expr>, op: CmpOpKind, right: Box<Expr> },
    IfExp { test: Box<Expr>, body: Box<Expr>, orelse: Box<Expr> },
    Lambda { params: Vec<Param>, body: Box<Expr> },
    Starred(Box<Expr>),
    GeneratorExp { elt: Box<Expr>, target: Box<Expr>, iter: Box<Expr> },
}

impl Expr {
    pub fn name(id: impl Into<String>) -> Self {
        Self::Name {
            id: id.into(),
            ctx: Ctx::Load,
        }
    }

    pub fn store(id: impl Into<String>) -> Self {
        Self::Name {
            id: id.into(),
            ctx: Ctx::Store,
        }
    }

    pub fn str(value: impl Into<String>) -> Self {
        Self::Literal(Literal::Str(value.into()))
    }

    pub fn int(value: i64) -> Self {
        Self::Literal(Literal::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Self::Literal(Literal::Float(value))
    }

    pub fn bool(value: bool) -> Self {
        Self::Literal(Literal::Bool(value))
    }

    pub fn none() -> Self {
        Self::Literal(Literal::None)
    }

    pub fn bytes(value: Vec<u8>) -> Self {
        Self::Literal(Literal::Bytes(value))
    }

    pub fn attr(value: Expr, attr: impl Into<String>) -> Self {
        Self::Attribute {
            value: Box::new(value),
            attr: attr.into(),
            ctx: Ctx::Load,
        }
    }

    pub fn call(func: Expr, args: Vec<Expr>) -> Self {
        Self::Call {
            func: Box::new(func),
            args,
            keywords: Vec::new(),
        }
    }

    pub fn call_name(func: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::call(Self::name(func), args)
    }

    /// `__import__("module")` — the root of most dynamic indirections.
    pub fn dunder_import(module: &str) -> Self {
        Self::call_name("__import__", vec![Self::str(module)])
    }

    pub fn binop(left: Expr, op: BinOpKind, right: Expr) -> Self {
        Self::BinOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn compare(left: Expr, op: CmpOpKind, right: Expr) -> Self {
        Self::Compare {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn not(operand: Expr) -> Self {
        Self::UnaryOp {
            op: UnaryOpKind::Not,
            operand: Box::new(operand),
        }
    }

    pub fn subscript(value: Expr, index: Expr) -> Self {
        Self::Subscript {
            value: Box::new(value),
            index: Box::new(index),
        }
    }

    pub fn lambda(params: Vec<Param>, body: Expr) -> Self {
        Self::Lambda {
            params,
            body: Box::new(body),
        }
    }

    pub const fn is_string_literal(&self) -> bool {
        matches!(self, Self::Literal(Literal::Str(_)))
    }

    /// Conservative purity check: an expression with no calls, lookups or
    /// comprehensions cannot observably run user code when evaluated.
    pub fn is_effect_free(&self) -> bool {
        match self {
            Self::Name { .. } | Self::Literal(_) => true,
            Self::Tuple(items) | Self::List(items) | Self::BoolOp { values: items, .. } => {
                items.iter().all(Self::is_effect_free)
            }
            Self::BinOp { left, right, .. } | Self::Compare { left, right, .. } => {
                left.is_effect_free() && right.is_effect_free()
            }
            Self::UnaryOp { operand, .. } => operand.is_effect_free(),
            Self::IfExp { test, body, orelse } => {
                test.is_effect_free() && body.is_effect_free() && orelse.is_effect_free()
            }
            _ => false,
        }
    }
}

/// Is this statement a docstring expression (a bare string literal)?
pub fn is_docstring(stmt: &Stmt) -> bool {
    matches!(stmt, Stmt::Expr(expr) if expr.is_string_literal())
}

/// Index at which injected statements go when the body's docstring must stay
/// the first statement.
pub fn docstring_insert_index(body: &[Stmt]) -> usize {
    usize::from(body.first().is_some_and(is_docstring))
}

fn walk_expr_mut<F: FnMut(&mut Expr)>(expr: &mut Expr, f: &mut F) {
    match expr {
        Expr::Name { .. } | Expr::Literal(_) => {}
        Expr::Tuple(items) | Expr::List(items) | Expr::BoolOp { values: items, .. } => {
            for item in items {
                walk_expr_mut(item, f);
            }
        }
        Expr::Dict { keys, values } => {
            for key in keys {
                walk_expr_mut(key, f);
            }
            for value in values {
                walk_expr_mut(value, f);
            }
        }
        Expr::Attribute { value, .. } | Expr::Starred(value) => walk_expr_mut(value, f),
        Expr::Subscript { value, index } => {
            walk_expr_mut(value, f);
            walk_expr_mut(index, f);
        }
        Expr::Call { func, args, keywords } => {
            walk_expr_mut(func, f);
            for arg in args {
                walk_expr_mut(arg, f);
            }
            for kw in keywords {
                walk_expr_mut(&mut kw.value, f);
            }
        }
        Expr::BinOp { left, right, .. } | Expr::Compare { left, right, .. } => {
            walk_expr_mut(left, f);
            walk_expr_mut(right, f);
        }
        Expr::UnaryOp { operand, .. } => walk_expr_mut(operand, f),
        Expr::IfExp { test, body, orelse } => {
            walk_expr_mut(test, f);
            walk_expr_mut(body, f);
            walk_expr_mut(orelse, f);
        }
        Expr::Lambda { params, body } => {
            for param in params {
                if let Some(default) = &mut param.default {
                    walk_expr_mut(default, f);
                }
            }
            walk_expr_mut(body, f);
        }
        Expr::GeneratorExp { elt, target, iter } => {
            walk_expr_mut(elt, f);
            walk_expr_mut(target, f);
            walk_expr_mut(iter, f);
        }
    }
    f(expr);
}

fn walk_stmt_exprs_mut<F: FnMut(&mut Expr)>(stmt: &mut Stmt, f: &mut F) {
    match stmt {
        Stmt::FunctionDef(def) => {
            for dec in &mut def.decorators {
                walk_expr_mut(dec, f);
            }
            for param in &mut def.params {
                if let Some(default) = &mut param.default {
                    walk_expr_mut(default, f);
                }
            }
            visit_exprs_mut(&mut def.body, f);
        }
        Stmt::ClassDef(def) => {
            for dec in &mut def.decorators {
                walk_expr_mut(dec, f);
            }
            for base in &mut def.bases {
                walk_expr_mut(base, f);
            }
            for kw in &mut def.keywords {
                walk_expr_mut(&mut kw.value, f);
            }
            visit_exprs_mut(&mut def.body, f);
        }
        Stmt::Assign { targets, value } => {
            for target in targets {
                walk_expr_mut(target, f);
            }
            walk_expr_mut(value, f);
        }
        Stmt::AugAssign { target, value, .. } => {
            walk_expr_mut(target, f);
            walk_expr_mut(value, f);
        }
        Stmt::Return(Some(value)) | Stmt::Raise(Some(value)) | Stmt::Expr(value) => {
            walk_expr_mut(value, f);
        }
        Stmt::Return(None) | Stmt::Raise(None) => {}
        Stmt::If { test, body, orelse } => {
            walk_expr_mut(test, f);
            visit_exprs_mut(body, f);
            visit_exprs_mut(orelse, f);
        }
        Stmt::While { test, body } => {
            walk_expr_mut(test, f);
            visit_exprs_mut(body, f);
        }
        Stmt::For { target, iter, body, orelse } => {
            walk_expr_mut(target, f);
            walk_expr_mut(iter, f);
            visit_exprs_mut(body, f);
            visit_exprs_mut(orelse, f);
        }
        Stmt::Try { body, handlers, orelse, finalbody } => {
            visit_exprs_mut(body, f);
            for handler in handlers {
                if let Some(typ) = &mut handler.typ {
                    walk_expr_mut(typ, f);
                }
                visit_exprs_mut(&mut handler.body, f);
            }
            visit_exprs_mut(orelse, f);
            visit_exprs_mut(finalbody, f);
        }
        Stmt::Delete { targets } => {
            for target in targets {
                walk_expr_mut(target, f);
            }
        }
        Stmt::Import { .. }
        | Stmt::ImportFrom { .. }
        | Stmt::Global { .. }
        | Stmt::Nonlocal { .. }
        | Stmt::Pass
        | Stmt::Break
        | Stmt::Continue => {}
    }
}

/// Post-order mutable visit over every expression in `body`, in a stable
/// left-to-right order. Children are visited before `f` sees their parent, so
/// a replacement installed by `f` is never re-entered.
pub fn visit_exprs_mut<F: FnMut(&mut Expr)>(body: &mut [Stmt], f: &mut F) {
    for stmt in body {
        walk_stmt_exprs_mut(stmt, f);
    }
}

/// Mutable visit over every statement body (module body included via the
/// caller), innermost first. `f` may grow or reorder the body it receives.
pub fn visit_bodies_mut<F: FnMut(&mut Vec<Stmt>)>(body: &mut Vec<Stmt>, f: &mut F) {
    for stmt in body.iter_mut() {
        match stmt {
            Stmt::FunctionDef(def) => visit_bodies_mut(&mut def.body, f),
            Stmt::ClassDef(def) => visit_bodies_mut(&mut def.body, f),
            Stmt::If { body, orelse, .. } | Stmt::For { body, orelse, .. } => {
                visit_bodies_mut(body, f);
                visit_bodies_mut(orelse, f);
            }
            Stmt::While { body, .. } => visit_bodies_mut(body, f),
            Stmt::Try { body, handlers, orelse, finalbody } => {
                visit_bodies_mut(body, f);
                for handler in handlers {
                    visit_bodies_mut(&mut handler.body, f);
                }
                visit_bodies_mut(orelse, f);
                visit_bodies_mut(finalbody, f);
            }
            _ => {}
        }
    }
    f(body);
}

/// Mutable visit over function bodies only (both sync and async defs),
/// innermost first.
pub fn visit_function_bodies_mut<F: FnMut(&mut Vec<Stmt>)>(body: &mut Vec<Stmt>, f: &mut F) {
    for stmt in body.iter_mut() {
        match stmt {
            Stmt::FunctionDef(def) => {
                visit_function_bodies_mut(&mut def.body, f);
                f(&mut def.body);
            }
            Stmt::ClassDef(def) => visit_function_bodies_mut(&mut def.body, f),
            Stmt::If { body, orelse, .. } | Stmt::For { body, orelse, .. } => {
                visit_function_bodies_mut(body, f);
                visit_function_bodies_mut(orelse, f);
            }
            Stmt::While { body, .. } => visit_function_bodies_mut(body, f),
            Stmt::Try { body, handlers, orelse, finalbody } => {
                visit_function_bodies_mut(body, f);
                for handler in handlers {
                    visit_function_bodies_mut(&mut handler.body, f);
                }
                visit_function_bodies_mut(orelse, f);
                visit_function_bodies_mut(finalbody, f);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_module() -> Module {
        Module {
            body: vec![
                Stmt::Assign {
                    targets: vec![Expr::store("x")],
                    value: Expr::str("hello"),
                },
                Stmt::FunctionDef(FunctionDef {
                    name: "greet".into(),
                    params: vec![Param::new("who")],
                    body: vec![Stmt::Return(Some(Expr::binop(
                        Expr::str("hi "),
                        BinOpKind::Add,
                        Expr::name("who"),
                    )))],
                    decorators: vec![],
                    is_async: false,
                }),
            ],
        }
    }

    #[test]
    fn test_visit_exprs_post_order() {
        let mut module = sample_module();
        let mut strings = Vec::new();
        visit_exprs_mut(&mut module.body, &mut |expr| {
            if let Expr::Literal(Literal::Str(s)) = expr {
                strings.push(s.clone());
            }
        });
        assert_eq!(strings, vec!["hello".to_string(), "hi ".to_string()]);
    }

    #[test]
    fn test_replacement_not_revisited() {
        let mut module = sample_module();
        let mut seen = 0;
        visit_exprs_mut(&mut module.body, &mut |expr| {
            if expr.is_string_literal() {
                seen += 1;
                *expr = Expr::call_name("decode", vec![Expr::str("payload")]);
            }
        });
        assert_eq!(seen, 2, "replacement arguments must not be re-visited");
    }

    #[test]
    fn test_bound_name_of_dotted_import() {
        let alias = ImportAlias {
            name: "os.path".into(),
            asname: None,
        };
        assert_eq!(alias.bound_name(), "os");
    }

    #[test]
    fn test_effect_free() {
        assert!(Expr::binop(Expr::int(1), BinOpKind::Add, Expr::name("x")).is_effect_free());
        assert!(!Expr::call_name("f", vec![]).is_effect_free());
    }

    #[test]
    fn test_serde_round_trip() {
        let module = sample_module();
        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(module, back);
    }
}
