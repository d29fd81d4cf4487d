use grcmap_query::{parse, BoolOp, ComparisonOp, Expression};
use proptest::prelude::*;

fn word() -> impl Strategy<Value = String> {
    // Quoted operands may carry spaces, quotes and backslashes.
    proptest::string::string_regex(r#"[A-Za-z0-9 _"\\.-]{1,12}"#).unwrap()
}

fn comparison() -> impl Strategy<Value = Expression> {
    (word(), proptest::sample::select(ComparisonOp::ALL.to_vec()), word())
        .prop_map(|(left, op, right)| Expression::Comparison { left, op, right })
}

fn expression() -> impl Strategy<Value = Expression> {
    comparison().prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| Expression::binary(l, BoolOp::And, r)),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| Expression::binary(l, BoolOp::Or, r)),
            inner.prop_map(|e| Expression::Not(Box::new(e))),
            (0usize..50).prop_map(Expression::previous),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn comparisons_roundtrip_through_display(expr in comparison()) {
        let parsed = parse(&expr.to_string()).expect("parse");
        prop_assert_eq!(parsed.expression, expr);
    }

    #[test]
    fn rendered_expressions_reparse_to_same_text(expr in expression()) {
        // Chains re-associate to the right, so compare the canonical text.
        let text = expr.to_string();
        let parsed = parse(&text).expect("parse");
        let reparsed = parse(&parsed.expression.to_string()).expect("reparse");
        prop_assert_eq!(reparsed.expression, parsed.expression);
    }
}
