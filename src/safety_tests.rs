//! Templates must never turn into code outside the runtime contract.

#[cfg(test)]
mod tests {
    use crate::codegen::compile_template;
    use crate::discovery::MemoryTemplateSource;
    use crate::engine::TemplateEngine;
    use crate::options::CompileOptions;
    use crate::scope::DataSource;
    use crate::validate::ErrorKind;
    use serde_json::{json, Value};

    fn sources(value: Value) -> Vec<DataSource> {
        match value {
            Value::Object(map) => vec![DataSource::Json(map)],
            _ => unreachable!(),
        }
    }

    fn error_kind(template: &str) -> ErrorKind {
        compile_template(template, &[], &CompileOptions::default(), None)
            .unwrap_err()
            .kind
    }

    #[test]
    fn test_expression_escapes_are_rejected_in_templates() {
        assert_eq!(error_kind("<p>{$a = 1}</p>"), ErrorKind::AssignmentForbidden);
        assert_eq!(error_kind("<p title=\"{$a += 1}\"/>"), ErrorKind::AssignmentForbidden);
        assert_eq!(error_kind("<p>{window!location}</p>"), ErrorKind::ForbiddenConstruct);
        assert_eq!(error_kind("<p>{require('fs')}</p>"), ErrorKind::UnknownOrForbiddenFunction);
        assert_eq!(error_kind("<p>{'x'.concat('y')}</p>"), ErrorKind::UnknownOrForbiddenFunction);
        assert_eq!(error_kind("<p>{$a!__proto__}</p>"), ErrorKind::ForbiddenConstruct);
        assert_eq!(error_kind("<p>{(1, 2)}</p>"), ErrorKind::ForbiddenConstruct);
        assert_eq!(error_kind("<p>{`x`}</p>"), ErrorKind::OperatorForbidden);
    }

    #[test]
    fn test_incomplete_expression_is_malformed() {
        assert_eq!(error_kind("<p>{1 +}</p>"), ErrorKind::MalformedExpression);
        assert_eq!(error_kind("<if test=\"{(}\">x</if>"), ErrorKind::MalformedExpression);
    }

    #[test]
    fn test_processing_instructions_are_rejected() {
        assert_eq!(error_kind("<p><?php echo 1; ?></p>"), ErrorKind::ForbiddenConstruct);
    }

    #[test]
    fn test_literal_output_is_json_escaped() {
        let out = compile_template(
            "<p title='a\"b'>c\\d\u{2028}</p>",
            &[],
            &CompileOptions::default(),
            None,
        )
        .unwrap();
        assert!(out
            .body
            .starts_with("$rt.write(\"<p title=\\\"a&quot;b\\\">c\\\\d"));
        assert!(out.body.ends_with("</p>\");\n"));
        assert_eq!(out.body.lines().count(), 1);
    }

    #[test]
    fn test_data_values_never_reach_the_code() {
        let data = sources(json!({"x": "\"); process.exit(1); (\""}));
        let out = compile_template("<p>$x</p>", &data, &CompileOptions::default(), None).unwrap();
        assert!(!out.bindings.contains("process"));
        assert!(!out.body.contains("process"));
        assert_eq!(out.bindings, "const _x = $src[0][\"x\"];\n");
    }

    #[test]
    fn test_dynamic_attribute_values_are_written_by_the_runtime() {
        let data = sources(json!({"x": "\" onmouseover=\"alert(1)"}));
        let out = compile_template(
            "<a title=\"say $x now\" class=\"$x\">t</a>",
            &data,
            &CompileOptions::default(),
            None,
        )
        .unwrap();
        assert!(out
            .body
            .contains("$rt.attr(\"title\", $rt.concat(\"say \", _x, \" now\"));"));
        assert!(out.body.contains("$rt.attr(\"class\", _x);"));
        assert!(!out.body.contains("$rt.echo"));
        assert!(!out.body.contains("onmouseover"));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let template = "<ul><loop on=\"$items\" as=\"$item\"><li class=\"c-$item\">{upper($item)}</li></loop></ul>";
        let data = sources(json!({"items": ["a", "b"]}));
        let compile = || {
            TemplateEngine::new(
                MemoryTemplateSource::new().with("list.xml", template),
                CompileOptions::default(),
            )
            .compile("list.xml", &data)
            .unwrap()
        };

        let first = compile();
        let second = compile();
        assert_eq!(first.name, second.name);
        assert_eq!(first.code, second.code);
        assert_eq!(first.freshness, second.freshness);
    }
}
