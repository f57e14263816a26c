// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! Static analysis of module source. A full walk of the AST collects the
//! static imports, export statements, dynamic specifier sites and
//! `import.meta.main` sites; a separate top-level walk (which does not
//! descend into function bodies) collects the value-producing statements and
//! detects top-level `await`.

use std::ops::Range;

use deno_ast::MediaType;
use deno_ast::ParsedSource;
use deno_ast::StartSourcePos;
use deno_ast::SourceRangedForSpanned;
use deno_ast::swc::ast;
use deno_ast::swc::ecma_visit::Visit;
use deno_ast::swc::ecma_visit::VisitWith;
use deno_ast::swc::ecma_visit::noop_visit_type;
use url::Url;

use crate::errors::RepleteError;

/// A static `import` declaration.
#[derive(Debug, Clone)]
pub struct StaticImport {
  pub specifier: String,
  /// The string literal, quotes included.
  pub specifier_range: Range<usize>,
  /// The whole statement.
  pub range: Range<usize>,
  pub default: Option<String>,
  pub namespace: Option<String>,
  /// Pairs of (imported name, local name).
  pub named: Vec<(String, String)>,
}

impl StaticImport {
  /// The local bindings this import introduces.
  pub fn names(&self) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(name) = &self.default {
      names.push(name.clone());
    }
    if let Some(name) = &self.namespace {
      names.push(name.clone());
    }
    for (_, local) in &self.named {
      names.push(local.clone());
    }
    names
  }
}

/// An export statement, classified by the edit it requires.
#[derive(Debug, Clone)]
pub enum ExportSite {
  /// `export default X`: the range up to the start of `X`, to become
  /// `$default = `.
  Default { range: Range<usize> },
  /// `export <decl>`: the `export` prefix, to be stripped.
  DeclarationPrefix { range: Range<usize> },
  /// `export * …` or `export { … } [from …]`: the whole statement, to be
  /// erased. A `from` clause carries the source specifier and its literal
  /// range.
  Statement {
    range: Range<usize>,
    source: Option<(String, Range<usize>)>,
  },
}

/// A site whose specifier is replaced with a resolved one. The three forms
/// `import("x")`, `import.meta.resolve("x")` and
/// `new URL("./x", import.meta.url)` replace different spans depending on
/// whether the surrounding text will be evaluated as a module or a script.
#[derive(Debug, Clone)]
pub struct DynamicSite {
  pub specifier: String,
  pub module_range: Range<usize>,
  pub script_range: Range<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleAnalysis {
  pub imports: Vec<StaticImport>,
  pub exports: Vec<ExportSite>,
  pub dynamics: Vec<DynamicSite>,
  pub mains: Vec<Range<usize>>,
}

impl ModuleAnalysis {
  /// Every static import, re-export and dynamic specifier, in source order.
  pub fn specifiers(&self) -> Vec<(usize, String)> {
    let mut specifiers = Vec::new();
    for import in &self.imports {
      specifiers
        .push((import.specifier_range.start, import.specifier.clone()));
    }
    for export in &self.exports {
      if let ExportSite::Statement {
        source: Some((specifier, range)),
        ..
      } = export
      {
        specifiers.push((range.start, specifier.clone()));
      }
    }
    for dynamic in &self.dynamics {
      specifiers.push((dynamic.module_range.start, dynamic.specifier.clone()));
    }
    specifiers.sort_by_key(|(offset, _)| *offset);
    specifiers
  }
}

#[derive(Debug, Clone, Default)]
pub struct TopAnalysis {
  /// Byte ranges of the value-producing statements, in source order.
  pub values: Vec<Range<usize>>,
  /// Whether the module awaits at the top level.
  pub wait: bool,
}

pub fn parse(
  locator: &Url,
  source: &str,
) -> Result<ParsedSource, RepleteError> {
  let media_type = match MediaType::from_specifier(locator) {
    MediaType::JavaScript | MediaType::Mjs | MediaType::Cjs => {
      MediaType::from_specifier(locator)
    }
    _ => MediaType::Mjs,
  };
  deno_ast::parse_module(deno_ast::ParseParams {
    specifier: locator.clone(),
    text: source.into(),
    media_type,
    capture_tokens: false,
    scope_analysis: false,
    maybe_syntax: None,
  })
  .map_err(|diagnostic| RepleteError::ParseFailed {
    locator: locator.to_string(),
    message: diagnostic.to_string(),
  })
}

pub fn analyze(parsed: &ParsedSource) -> ModuleAnalysis {
  let program_start = parsed.range().start;
  let mut analysis = ModuleAnalysis::default();
  let program_ref = parsed.program_ref();
  let module = program_ref.unwrap_module();
  for item in &module.body {
    let ast::ModuleItem::ModuleDecl(declaration) = item else {
      continue;
    };
    match declaration {
      ast::ModuleDecl::Import(import) => {
        analysis.imports.push(static_import(import, program_start));
      }
      ast::ModuleDecl::ExportDefaultDecl(export) => {
        analysis.exports.push(ExportSite::Default {
          range: byte_range(export.range().start, export.decl.range().start, program_start),
        });
      }
      ast::ModuleDecl::ExportDefaultExpr(export) => {
        analysis.exports.push(ExportSite::Default {
          range: byte_range(export.range().start, export.expr.range().start, program_start),
        });
      }
      ast::ModuleDecl::ExportDecl(export) => {
        analysis.exports.push(ExportSite::DeclarationPrefix {
          range: byte_range(export.range().start, export.decl.range().start, program_start),
        });
      }
      ast::ModuleDecl::ExportNamed(export) => {
        analysis.exports.push(ExportSite::Statement {
          range: export.range().as_byte_range(program_start),
          source: export.src.as_ref().map(|src| {
            (
              src.value.as_wtf8().to_string_lossy().into_owned(),
              src.range().as_byte_range(program_start),
            )
          }),
        });
      }
      ast::ModuleDecl::ExportAll(export) => {
        analysis.exports.push(ExportSite::Statement {
          range: export.range().as_byte_range(program_start),
          source: Some((
            export.src.value.as_wtf8().to_string_lossy().into_owned(),
            export.src.range().as_byte_range(program_start),
          )),
        });
      }
      _ => {}
    }
  }
  let mut collector = SiteCollector {
    program_start,
    analysis: &mut analysis,
  };
  module.visit_with(&mut collector);
  analysis
}

pub fn analyze_top(parsed: &ParsedSource) -> TopAnalysis {
  let mut walk = TopWalk {
    program_start: parsed.range().start,
    top: TopAnalysis::default(),
  };
  parsed.program_ref().unwrap_module().visit_with(&mut walk);
  walk.top
}

fn byte_range(
  start: deno_ast::SourcePos,
  end: deno_ast::SourcePos,
  program_start: StartSourcePos,
) -> Range<usize> {
  deno_ast::SourceRange::new(start, end).as_byte_range(program_start)
}

fn static_import(
  import: &ast::ImportDecl,
  program_start: StartSourcePos,
) -> StaticImport {
  let mut record = StaticImport {
    specifier: import.src.value.as_wtf8().to_string_lossy().into_owned(),
    specifier_range: import.src.range().as_byte_range(program_start),
    range: import.range().as_byte_range(program_start),
    default: None,
    namespace: None,
    named: Vec::new(),
  };
  for specifier in &import.specifiers {
    match specifier {
      ast::ImportSpecifier::Default(default) => {
        record.default = Some(default.local.sym.to_string());
      }
      ast::ImportSpecifier::Namespace(namespace) => {
        record.namespace = Some(namespace.local.sym.to_string());
      }
      ast::ImportSpecifier::Named(named) => {
        let imported = match &named.imported {
          Some(ast::ModuleExportName::Ident(ident)) => ident.sym.to_string(),
          Some(ast::ModuleExportName::Str(text)) => text.value.as_wtf8().to_string_lossy().into_owned(),
          None => named.local.sym.to_string(),
        };
        record.named.push((imported, named.local.sym.to_string()));
      }
    }
  }
  record
}

fn is_import_meta(expr: &ast::Expr) -> bool {
  matches!(
    expr,
    ast::Expr::MetaProp(ast::MetaPropExpr {
      kind: ast::MetaPropKind::ImportMeta,
      ..
    })
  )
}

/// Matches `import.meta.<name>`.
fn is_import_meta_member(expr: &ast::Expr, name: &str) -> bool {
  match expr {
    ast::Expr::Member(member) => {
      is_import_meta(&member.obj)
        && matches!(&member.prop, ast::MemberProp::Ident(ident) if ident.sym.as_str() == name)
    }
    _ => false,
  }
}

fn string_argument(args: &[ast::ExprOrSpread]) -> Option<&ast::Str> {
  let first = args.first()?;
  if first.spread.is_some() {
    return None;
  }
  match first.expr.as_ref() {
    ast::Expr::Lit(ast::Lit::Str(text)) => Some(text),
    _ => None,
  }
}

/// Collects the sites that may appear anywhere in the module, not just at
/// the top level.
struct SiteCollector<'a> {
  program_start: StartSourcePos,
  analysis: &'a mut ModuleAnalysis,
}

impl Visit for SiteCollector<'_> {
  noop_visit_type!();

  fn visit_call_expr(&mut self, node: &ast::CallExpr) {
    node.visit_children_with(self);

    match &node.callee {
      ast::Callee::Import(_) => {
        if let Some(text) = string_argument(&node.args) {
          let range = text.range().as_byte_range(self.program_start);
          self.analysis.dynamics.push(DynamicSite {
            specifier: text.value.as_wtf8().to_string_lossy().into_owned(),
            module_range: range.clone(),
            script_range: range,
          });
        }
      }
      ast::Callee::Expr(callee) => {
        if is_import_meta_member(callee, "resolve") {
          if let Some(text) = string_argument(&node.args) {
            let range = node.range().as_byte_range(self.program_start);
            self.analysis.dynamics.push(DynamicSite {
              specifier: text.value.as_wtf8().to_string_lossy().into_owned(),
              module_range: range.clone(),
              script_range: range,
            });
          }
        }
      }
      _ => {}
    }
  }

  fn visit_new_expr(&mut self, node: &ast::NewExpr) {
    node.visit_children_with(self);

    let ast::Expr::Ident(callee) = node.callee.as_ref() else {
      return;
    };
    if callee.sym.as_str() != "URL" {
      return;
    }
    let Some(args) = &node.args else {
      return;
    };
    if args.len() != 2 || args[1].spread.is_some() {
      return;
    }
    let Some(text) = string_argument(args) else {
      return;
    };
    // Only relative first arguments are rewritten. Absolute-path and fully
    // qualified forms are left untouched.
    if !text.value.starts_with("./") && !text.value.starts_with("../") {
      return;
    }
    if !is_import_meta_member(&args[1].expr, "url") {
      return;
    }
    let module_range = text.range().as_byte_range(self.program_start);
    let script_range = byte_range(
      text.range().start,
      args[1].expr.range().end,
      self.program_start,
    );
    self.analysis.dynamics.push(DynamicSite {
      specifier: text.value.as_wtf8().to_string_lossy().into_owned(),
      module_range,
      script_range,
    });
  }

  fn visit_member_expr(&mut self, node: &ast::MemberExpr) {
    node.visit_children_with(self);

    if is_import_meta(&node.obj)
      && matches!(&node.prop, ast::MemberProp::Ident(ident) if ident.sym.as_str() == "main")
    {
      self
        .analysis
        .mains
        .push(node.range().as_byte_range(self.program_start));
    }
  }
}

/// The top-level walk. It descends into blocks but never into function
/// bodies, since statements inside a function neither produce module values
/// nor suspend the module on `await`.
struct TopWalk {
  program_start: StartSourcePos,
  top: TopAnalysis,
}

impl Visit for TopWalk {
  noop_visit_type!();

  fn visit_expr_stmt(&mut self, node: &ast::ExprStmt) {
    self
      .top
      .values
      .push(node.range().as_byte_range(self.program_start));
    node.visit_children_with(self);
  }

  fn visit_await_expr(&mut self, node: &ast::AwaitExpr) {
    self.top.wait = true;
    node.visit_children_with(self);
  }

  fn visit_for_of_stmt(&mut self, node: &ast::ForOfStmt) {
    if node.is_await {
      self.top.wait = true;
    }
    node.visit_children_with(self);
  }

  fn visit_function(&mut self, _node: &ast::Function) {}

  fn visit_arrow_expr(&mut self, _node: &ast::ArrowExpr) {}

  fn visit_constructor(&mut self, _node: &ast::Constructor) {}

  fn visit_getter_prop(&mut self, _node: &ast::GetterProp) {}

  fn visit_setter_prop(&mut self, _node: &ast::SetterProp) {}

  fn visit_static_block(&mut self, _node: &ast::StaticBlock) {}
}
