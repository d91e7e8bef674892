#[cfg(test)]
mod tests {
    use crate::codegen::compile_template;
    use crate::document::Document;
    use crate::options::CompileOptions;
    use crate::scope::DataSource;
    use crate::transform::Transformer;
    use serde_json::{json, Value};

    fn transform(source: &str) -> String {
        let mut doc = Document::parse(source, false).unwrap();
        Transformer::new(None).apply(&mut doc).unwrap();
        doc.to_xml(doc.root())
    }

    #[test]
    fn test_nested_matches_are_rewritten_innermost_first() {
        let out = transform(
            "<r match=\"//p\"><P>{select('node()')}</P></r><p id=\"1\"><i><p id=\"2\">t</p></i></p>",
        );
        assert_eq!(out, "<P id=\"1\"><i><P id=\"2\">t</P></i></P>");
    }

    #[test]
    fn test_later_rules_run_first() {
        let chained = transform("<r match=\"//b\"><x/></r><r match=\"//a\"><b/></r><a/>");
        assert_eq!(chained, "<x/>");

        let unchained = transform("<r match=\"//a\"><b/></r><r match=\"//b\"><x/></r><a/>");
        assert_eq!(unchained, "<b/>");
    }

    #[test]
    fn test_parameters_are_not_forwarded() {
        let out = transform(
            "<r match=\"//btn\" label=\"Go\"><button>$label</button></r>\
             <btn/><btn label=\"Stop\" class=\"x\"/>",
        );
        assert_eq!(out, "<button>Go</button><button class=\"x\">Stop</button>");
    }

    #[test]
    fn test_rule_output_is_compiled() {
        let sources = match json!({"name": "Ada"}) {
            Value::Object(map) => vec![DataSource::Json(map)],
            _ => unreachable!(),
        };
        let out = compile_template(
            "<r match=\"//hello\" greeting=\"Hi\"><p>$greeting $name</p></r><hello/>",
            &sources,
            &CompileOptions::default(),
            None,
        )
        .unwrap();
        assert_eq!(out.bindings, "const _name = $src[0][\"name\"];\n");
        assert_eq!(
            out.body,
            "$rt.write(\"<p>Hi \");\n$rt.echo(_name);\n$rt.write(\"</p>\");\n"
        );
    }
}
