#[cfg(test)]
mod tests {
    use crate::scope::{DataSource, Environment};
    use crate::static_eval::{
        analyze, evaluate_static, template_string, Analysis, PseudoFunctions, PseudoHandler,
        Substitution, VariableResolver,
    };
    use crate::validate::{ErrorKind, Result};
    use serde_json::{json, Value};

    fn sources() -> Vec<DataSource> {
        match json!({"name": "Ada", "user": {"name": "Ada"}, "a": 0, "items": [1, 2]}) {
            Value::Object(map) => vec![DataSource::Json(map)],
            _ => unreachable!(),
        }
    }

    /// Analyzes `source` against the test data and returns the analysis and the bindings.
    fn run_with(source: &str, pseudo: &PseudoFunctions<'_>) -> Result<(Analysis, String)> {
        let data = sources();
        let mut env = Environment::new(&data);
        let mut resolve =
            |name: &str, _: bool| -> Result<Substitution> { Ok(env.substitution(name)) };
        let resolver: &mut dyn VariableResolver = &mut resolve;
        let analysis = analyze(source, Some(resolver), pseudo)?;
        Ok((analysis, env.render_bindings()))
    }

    fn run(source: &str) -> Result<(Analysis, String)> {
        run_with(source, &PseudoFunctions::new())
    }

    fn kind(source: &str) -> ErrorKind {
        run(source).unwrap_err().kind
    }

    #[test]
    fn test_builtins_fold_with_static_arguments() {
        assert_eq!(
            evaluate_static("upper('ab') + len([1, 2, 3])").unwrap(),
            Some(json!("AB3"))
        );
        assert_eq!(evaluate_static("trim('  x ')").unwrap(), Some(json!("x")));
    }

    #[test]
    fn test_builtin_with_variable_argument_stays_residual() {
        let (analysis, bindings) = run("upper($name)").unwrap();
        assert!(!analysis.is_static());
        assert_eq!(analysis.code, "$rt.fn.upper(_name)");
        assert_eq!(bindings, "const _name = $src[0][\"name\"];\n");
    }

    #[test]
    fn test_runtime_only_function_is_deferred() {
        let (analysis, _) = run("now()").unwrap();
        assert_eq!(analysis.code, "$rt.fn.now()");
        assert!(analysis.value.is_none());
    }

    #[test]
    fn test_unresolved_variable_folds_as_null() {
        let (analysis, bindings) = run("$missing ?? 'fallback'").unwrap();
        assert_eq!(analysis.value, Some(json!("fallback")));
        assert!(bindings.is_empty());
    }

    #[test]
    fn test_member_shorthand_is_null_safe() {
        let (analysis, _) = run("$user!name").unwrap();
        assert_eq!(analysis.code, "_user?.name");
    }

    #[test]
    fn test_necklace_chain() {
        let (analysis, _) = run("$a : 'b'").unwrap();
        assert_eq!(analysis.code, "$rt.chain(() => (_a), () => (\"b\"))");

        let (folded, _) = run("'' : 'x' : $a").unwrap();
        assert_eq!(folded.value, Some(json!("x")));
    }

    #[test]
    fn test_double_quoted_strings_interpolate() {
        let (analysis, _) = run("\"Hi $name!\"").unwrap();
        assert_eq!(analysis.code, "$rt.concat(\"Hi \", _name, \"!\")");

        let (single, _) = run("'Hi $name'").unwrap();
        assert_eq!(single.value, Some(json!("Hi $name")));
    }

    #[test]
    fn test_folding_follows_js_semantics() {
        assert_eq!(evaluate_static("'5' * '2'").unwrap(), Some(json!(10)));
        assert_eq!(evaluate_static("'5' - 2").unwrap(), Some(json!(3)));
        assert_eq!(evaluate_static("true + 1").unwrap(), Some(json!(2)));
        assert_eq!(evaluate_static("'b' + null").unwrap(), Some(json!("bnull")));
        assert_eq!(evaluate_static("'10' < '9'").unwrap(), Some(json!(true)));
    }

    #[test]
    fn test_pseudo_functions() {
        let handler: PseudoHandler<'static> = Box::new(|args: &[Value]| -> Result<Value> {
            Ok(json!(format!("T:{}", template_string(&args[0]))))
        });
        let mut pseudo = PseudoFunctions::new();
        pseudo.insert("tr".to_string(), Some(handler));
        pseudo.insert("ext".to_string(), None);

        let (folded, _) = run_with("tr('a')", &pseudo).unwrap();
        assert_eq!(folded.value, Some(json!("T:a")));

        let err = run_with("tr($name)", &pseudo).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenConstruct);

        let (deferred, _) = run_with("ext($name, 1)", &pseudo).unwrap();
        assert_eq!(deferred.code, "$rt.call(\"ext\", _name, 1)");
    }

    #[test]
    fn test_rejections() {
        assert_eq!(kind("$a = 1"), ErrorKind::AssignmentForbidden);
        assert_eq!(kind("$a++"), ErrorKind::AssignmentForbidden);
        assert_eq!(kind("`cmd`"), ErrorKind::OperatorForbidden);
        assert_eq!(kind("eval('1')"), ErrorKind::ForbiddenConstruct);
        assert_eq!(kind("system('ls')"), ErrorKind::UnknownOrForbiddenFunction);
        assert_eq!(kind("$user!constructor"), ErrorKind::ForbiddenConstruct);
        assert_eq!(kind("(1"), ErrorKind::MalformedExpression);
    }
}
