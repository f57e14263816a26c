// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! Turning a module fragment into an `eval`-safe script. Import and export
//! statements are stripped, top level declarations become assignments into a
//! named scope object, dynamic specifiers are replaced with their resolved
//! forms, and the result is wrapped in a harness that persists every
//! declared name on `$scopes[<name>]` so that state survives across
//! evaluations.

use deno_ast::ParsedSource;
use deno_ast::SourceRangedForSpanned;
use deno_ast::StartSourcePos;
use deno_ast::swc::ast;

use crate::analyze::ExportSite;
use crate::analyze::ModuleAnalysis;
use crate::analyze::TopAnalysis;
use crate::rewrite::Alteration;
use crate::rewrite::alter_string;

pub fn replize(
  source: &str,
  parsed: &ParsedSource,
  analysis: &ModuleAnalysis,
  top: &TopAnalysis,
  resolved_dynamics: &[String],
  scope: &str,
) -> String {
  let (payload, declared) =
    edit_source(source, parsed, analysis, top, resolved_dynamics);
  harness(&payload, &declared, analysis, scope)
}

/// Apply the rewriting rules, producing the payload script and the list of
/// top level names it assigns.
fn edit_source(
  source: &str,
  parsed: &ParsedSource,
  analysis: &ModuleAnalysis,
  top: &TopAnalysis,
  resolved_dynamics: &[String],
) -> (String, Vec<String>) {
  let program_start = parsed.range().start;
  let mut alterations = Vec::new();
  let mut declared = Vec::new();
  let mut hoisted = Vec::new();

  for import in &analysis.imports {
    alterations.push(Alteration::new(import.range.clone(), ""));
  }
  for export in &analysis.exports {
    match export {
      ExportSite::Default { range } => {
        alterations.push(Alteration::new(range.clone(), "$default = "));
      }
      ExportSite::DeclarationPrefix { range } => {
        alterations.push(Alteration::new(range.clone(), ""));
      }
      ExportSite::Statement { range, .. } => {
        alterations.push(Alteration::new(range.clone(), ""));
      }
    }
  }
  for (dynamic, resolved) in analysis.dynamics.iter().zip(resolved_dynamics) {
    alterations.push(Alteration::new(
      dynamic.script_range.clone(),
      serde_json::to_string(resolved).unwrap(),
    ));
  }
  for main in &analysis.mains {
    alterations.push(Alteration::new(main.clone(), "true"));
  }

  for item in &parsed.program_ref().unwrap_module().body {
    let declaration = match item {
      ast::ModuleItem::Stmt(ast::Stmt::Decl(declaration)) => declaration,
      ast::ModuleItem::ModuleDecl(ast::ModuleDecl::ExportDecl(export)) => {
        &export.decl
      }
      _ => continue,
    };
    edit_declaration(
      declaration,
      program_start,
      &mut alterations,
      &mut declared,
      &mut hoisted,
    );
  }

  if !hoisted.is_empty() {
    let prelude = hoisted
      .iter()
      .map(|name| format!("{} = ${};", name, name))
      .collect::<Vec<String>>()
      .join(" ");
    alterations.push(Alteration::insert(0, format!("{} ", prelude)));
  }

  if top.wait {
    for value in &top.values {
      alterations.push(Alteration::insert(value.start, "$await = "));
    }
  }

  let mut payload = alter_string(source, alterations);
  if top.wait {
    payload = format!(
      "(async function () {{ let $await; {}\nreturn $await;\n}}())",
      payload
    );
  }
  (payload, declared)
}

fn edit_declaration(
  declaration: &ast::Decl,
  program_start: StartSourcePos,
  alterations: &mut Vec<Alteration>,
  declared: &mut Vec<String>,
  hoisted: &mut Vec<String>,
) {
  match declaration {
    ast::Decl::Var(var) => {
      let Some(first) = var.decls.first() else {
        return;
      };
      alterations.push(Alteration::new(
        deno_ast::SourceRange::new(var.range().start, first.range().start)
          .as_byte_range(program_start),
        "",
      ));
      for declarator in &var.decls {
        collect_pattern_names(&declarator.name, declared);
        match &declarator.name {
          ast::Pat::Ident(binding) => {
            if declarator.init.is_none() {
              let end = binding.range().as_byte_range(program_start).end;
              alterations.push(Alteration::insert(end, " = undefined"));
            }
          }
          ast::Pat::Object(_) => {
            // A statement may not begin with `{`, so the whole assignment
            // is parenthesized.
            if let Some(init) = &declarator.init {
              let pattern_start = declarator
                .name
                .range()
                .as_byte_range(program_start)
                .start;
              let init_end = init.range().as_byte_range(program_start).end;
              alterations.push(Alteration::insert(pattern_start, "("));
              alterations.push(Alteration::insert(init_end, ")"));
            }
          }
          _ => {}
        }
      }
    }
    ast::Decl::Fn(function) => {
      // Renaming the declaration to `$name` keeps hoisting intact while the
      // prelude assignment gives the scope object a live reference.
      let name = function.ident.sym.to_string();
      alterations.push(Alteration::new(
        function.ident.range().as_byte_range(program_start),
        format!("${}", name),
      ));
      hoisted.push(name.clone());
      declared.push(name);
    }
    ast::Decl::Class(class) => {
      let name = class.ident.sym.to_string();
      let range = class.range().as_byte_range(program_start);
      alterations.push(Alteration::insert(range.start, format!("{} = ", name)));
      alterations.push(Alteration::insert(range.end, ";"));
      declared.push(name);
    }
    _ => {}
  }
}

fn collect_pattern_names(pattern: &ast::Pat, names: &mut Vec<String>) {
  match pattern {
    ast::Pat::Ident(binding) => names.push(binding.id.sym.to_string()),
    ast::Pat::Array(array) => {
      for element in array.elems.iter().flatten() {
        collect_pattern_names(element, names);
      }
    }
    ast::Pat::Object(object) => {
      for property in &object.props {
        match property {
          ast::ObjectPatProp::KeyValue(pair) => {
            collect_pattern_names(&pair.value, names);
          }
          ast::ObjectPatProp::Assign(assign) => {
            names.push(assign.key.sym.to_string());
          }
          ast::ObjectPatProp::Rest(rest) => {
            collect_pattern_names(&rest.arg, names);
          }
        }
      }
    }
    ast::Pat::Assign(assign) => collect_pattern_names(&assign.left, names),
    ast::Pat::Rest(rest) => collect_pattern_names(&rest.arg, names),
    _ => {}
  }
}

/// Embed the payload in the fixed harness. The harness runs in sloppy mode
/// so that `this` is the global object; only the payload runs in strict
/// mode. `with ($scope)` makes assignments to bare identifiers land on the
/// scope object, including late assignments from async code.
fn harness(
  payload: &str,
  declared: &[String],
  analysis: &ModuleAnalysis,
  scope: &str,
) -> String {
  let scope_key = serde_json::to_string(scope).unwrap();
  let payload_literal = serde_json::to_string(payload).unwrap();
  let mut lines = vec![
    "(function () {".to_owned(),
    "    if (this.$scopes === undefined) {".to_owned(),
    "        this.$scopes = Object.create(null);".to_owned(),
    "    }".to_owned(),
    format!("    if (this.$scopes[{}] === undefined) {{", scope_key),
    format!("        this.$scopes[{}] = Object.assign(", scope_key),
    "            Object.create(null),".to_owned(),
    "            {$default: undefined, $value: undefined}".to_owned(),
    "        );".to_owned(),
    "    }".to_owned(),
    format!("    var $scope = this.$scopes[{}];", scope_key),
  ];
  for name in declared {
    let key = serde_json::to_string(name).unwrap();
    lines.push(format!("    $scope[{}] = $scope[{}];", key, key));
  }
  for (index, import) in analysis.imports.iter().enumerate() {
    if let Some(name) = &import.default {
      lines.push(format!(
        "    $scope[{}] = $imports[{}].default;",
        serde_json::to_string(name).unwrap(),
        index
      ));
    }
    if let Some(name) = &import.namespace {
      lines.push(format!(
        "    $scope[{}] = $imports[{}];",
        serde_json::to_string(name).unwrap(),
        index
      ));
    }
    for (imported, local) in &import.named {
      lines.push(format!(
        "    $scope[{}] = $imports[{}][{}];",
        serde_json::to_string(local).unwrap(),
        index,
        serde_json::to_string(imported).unwrap()
      ));
    }
  }
  lines.push("    with ($scope) {".to_owned());
  lines.push("        return $scope.$value = (function () {".to_owned());
  lines.push("            \"use strict\";".to_owned());
  lines.push(format!("            return eval({});", payload_literal));
  lines.push("        }());".to_owned());
  lines.push("    }".to_owned());
  lines.push("}).call(this);".to_owned());
  lines.join("\n")
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use url::Url;

  use super::*;
  use crate::analyze;
  use crate::rewrite::count_lines;

  fn prepare(source: &str) -> (ParsedSource, ModuleAnalysis, TopAnalysis) {
    let parsed = analyze::parse(
      &Url::parse("file:///fragment.js").unwrap(),
      source,
    )
    .unwrap();
    let analysis = analyze::analyze(&parsed);
    let top = analyze::analyze_top(&parsed);
    (parsed, analysis, top)
  }

  fn payload_of(source: &str, resolved: &[String]) -> (String, Vec<String>) {
    let (parsed, analysis, top) = prepare(source);
    edit_source(source, &parsed, &analysis, &top, resolved)
  }

  #[test]
  fn test_declarations_become_assignments() {
    let source = concat!(
      "const x = \"x\"; let y = \"y\"; z();\n",
      "function z() { return \"z\"; }\n",
      "const {a, b} = {a: \"a\", b: \"b\"};\n",
    );
    let (payload, declared) = payload_of(source, &[]);
    assert_eq!(
      payload,
      concat!(
        "z = $z; x = \"x\"; y = \"y\"; z();\n",
        "function $z() { return \"z\"; }\n",
        "({a, b} = {a: \"a\", b: \"b\"});\n",
      )
    );
    assert_eq!(declared, vec!["x", "y", "z", "a", "b"]);
    assert_eq!(count_lines(&payload), count_lines(source));
  }

  #[test]
  fn test_uninitialized_declarator() {
    let (payload, declared) = payload_of("let a;\n", &[]);
    assert_eq!(payload, "a = undefined;\n");
    assert_eq!(declared, vec!["a"]);
  }

  #[test]
  fn test_array_destructuring() {
    let (payload, declared) = payload_of("const [a, , b] = pair();\n", &[]);
    assert_eq!(payload, "[a, , b] = pair();\n");
    assert_eq!(declared, vec!["a", "b"]);
  }

  #[test]
  fn test_class_declaration() {
    let (payload, declared) =
      payload_of("class Cat {\n    meow() {}\n}\n", &[]);
    assert_eq!(payload, "Cat = class Cat {\n    meow() {}\n};\n");
    assert_eq!(declared, vec!["Cat"]);
  }

  #[test]
  fn test_imports_erased_lines_preserved() {
    let source = concat!(
      "import def from \"./a.js\";\n",
      "import {\n",
      "    long,\n",
      "    form\n",
      "} from \"./b.js\";\n",
      "def(long, form);\n",
    );
    let (payload, _) = payload_of(source, &[]);
    assert_eq!(payload, "\n\n\n\n\ndef(long, form);\n");
    assert_eq!(count_lines(&payload), count_lines(source));
  }

  #[test]
  fn test_exports() {
    let source = concat!(
      "export default 42;\n",
      "export const a = 1;\n",
      "export {a as b};\n",
      "export * from \"./d.js\";\n",
    );
    let (payload, declared) = payload_of(source, &[]);
    assert_eq!(payload, "$default = 42;\na = 1;\n\n\n");
    assert_eq!(declared, vec!["a"]);
  }

  #[test]
  fn test_dynamic_sites_and_main() {
    let source = concat!(
      "const mod = import(\"./m.js\");\n",
      "const asset = new URL(\"./a.png\", import.meta.url);\n",
      "import.meta.main;\n",
    );
    let resolved = vec![
      "file:///v0/T0k3nT0k/m.js".to_owned(),
      "file:///v0/T0k3nT0k/a.png".to_owned(),
    ];
    let (payload, _) = payload_of(source, &resolved);
    assert_eq!(
      payload,
      concat!(
        "mod = import(\"file:///v0/T0k3nT0k/m.js\");\n",
        "asset = new URL(\"file:///v0/T0k3nT0k/a.png\");\n",
        "true;\n",
      )
    );
  }

  #[test]
  fn test_top_level_await_wrapping() {
    let source = "if (true) { let a; a = await 42; a + 1; }\n";
    let (payload, _) = payload_of(source, &[]);
    assert_eq!(
      payload,
      concat!(
        "(async function () { let $await; ",
        "if (true) { let a; $await = a = await 42; $await = a + 1; }\n",
        "\nreturn $await;\n}())",
      )
    );
  }

  #[test]
  fn test_harness_shape() {
    let source = "import def from \"./a.js\";\nconst x = def;\n";
    let (parsed, analysis, top) = prepare(source);
    let script = replize(source, &parsed, &analysis, &top, &[], "demo");
    assert!(script.starts_with("(function () {"));
    assert!(script.ends_with("}).call(this);"));
    assert!(script.contains("this.$scopes = Object.create(null);"));
    assert!(script.contains("var $scope = this.$scopes[\"demo\"];"));
    assert!(script.contains("$scope[\"x\"] = $scope[\"x\"];"));
    assert!(script.contains("$scope[\"def\"] = $imports[0].default;"));
    assert!(script.contains("with ($scope) {"));
    assert!(script.contains("\"use strict\";"));
    assert!(script.contains("return eval("));
    // The payload is embedded as a string literal, newlines escaped.
    assert!(script.contains("\\nx = def;"));
  }

  #[test]
  fn test_redeclaration_is_safe() {
    // `const x = 1` twice in a row must not leave any `const` behind.
    let (payload, _) = payload_of("const x = 1;\n", &[]);
    assert_eq!(payload, "x = 1;\n");
    let (payload, _) = payload_of("const x = 2;\n", &[]);
    assert_eq!(payload, "x = 2;\n");
  }
}
