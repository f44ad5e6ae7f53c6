use std::collections::BTreeMap;

use anywire::{Any, Serializable, TextMode};

/// Serialize a host value, print it natively, parse the text back and
/// compare the recovered type and bytes.
fn check_roundtrip<T: Serializable>(value: &T) {
    let any = Any::from_typed(value).unwrap();
    let text = any.print().unwrap_or_else(|e| panic!("print failed: {}", e));
    let back = Any::from_text(&text, TextMode::Normal)
        .unwrap_or_else(|e| panic!("reparse of {:?} failed: {}", text, e));
    assert_eq!(back.type_str(), any.type_str(), "type drifted through {:?}", text);
    assert_eq!(back.value(), any.value(), "value drifted through {:?}", text);
}

#[test]
fn scalars() {
    check_roundtrip(&true);
    check_roundtrip(&false);
    check_roundtrip(&0u8);
    check_roundtrip(&b'z');
    check_roundtrip(&b'%');
    check_roundtrip(&-42i32);
    check_roundtrip(&(1i64 << 40));
    check_roundtrip(&1.5f64);
    check_roundtrip(&String::from("hello"));
    check_roundtrip(&String::from("with \"quotes\" and 100%"));
    check_roundtrip(&String::from("line\nbreak"));
}

#[test]
fn containers() {
    check_roundtrip(&vec![1i32, 2, 3]);
    check_roundtrip(&Vec::<i32>::new());
    check_roundtrip(&vec![vec![1i32], vec![], vec![2, 3]]);
    check_roundtrip(&(7i32, String::from("seven")));
    check_roundtrip(&(1i32, 2.5f64, String::from("x"), false));
    check_roundtrip(&Some(5i32));
    check_roundtrip(&Option::<i32>::None);
    check_roundtrip(&Some(vec![(1i32, String::from("a"))]));

    let mut m = BTreeMap::new();
    m.insert(String::from("k"), (7i32, 1.5f64));
    m.insert(String::from("l"), (8i32, 2.5f64));
    check_roundtrip(&m);
}

#[test]
fn nested_any() {
    let inner = Any::from_typed(&vec![1i32, 2]).unwrap();
    check_roundtrip(&inner);
    let double = Any::from_typed(&inner).unwrap();
    check_roundtrip(&double);
}

#[test]
fn scan_matches_framing() {
    for text in [
        "42",
        "[1, 2, 3]",
        "{\"a\": [true], \"b\": []}",
        "(1, \"x\", 2.5)",
        "<oli>[7]",
        "<a><t2is>(1, \"one\")",
        "error(\"t\", \"id\", \"msg\", <i>3)",
    ] {
        let any = Any::from_text(text, TextMode::Normal).unwrap();
        let wire = any.to_wire();
        let back = Any::from_wire(&wire).unwrap();
        assert_eq!(&back, &any, "wire framing drifted for {:?}", text);
        let (tc, vc) =
            anywire::scan(any.type_str().as_bytes(), any.value(), true).unwrap();
        assert_eq!(tc, any.type_str().as_bytes().len());
        assert_eq!(vc, any.value().len());
    }
}

#[test]
fn defaults_scan_cleanly() {
    for ty in ["", "b", "c", "i", "I", "d", "s", "li", "mst2id", "t2ib", "oi", "xi", "X", "e", "a", "lxI", "olmsa"] {
        let val = anywire::default_value(ty.as_bytes()).unwrap();
        let (tc, vc) = anywire::scan(ty.as_bytes(), &val, true).unwrap();
        assert_eq!(tc, ty.len(), "type {:?}", ty);
        assert_eq!(vc, val.len(), "type {:?}", ty);
    }
}

#[test]
fn json_output_reparses_as_json() {
    for (text, expect) in [
        ("{\"k\": (7, 1.5)}", "{\"k\":[7,1.5]}"),
        ("[1, 2]", "[1,2]"),
        ("<oi>", "null"),
        ("(true, \"x\")", "[true,\"x\"]"),
    ] {
        let any = Any::from_text(text, TextMode::Normal).unwrap();
        assert_eq!(any.print_json().unwrap(), expect);
        // JSON output is accepted by the JSON-mode parser
        Any::from_text(&any.print_json().unwrap(), TextMode::Json).unwrap();
    }
}
