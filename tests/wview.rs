use anywire::{Any, ErrorKind, TextMode, WView};

fn view(text: &str) -> WView {
    let a = Any::from_text(text, TextMode::Normal).unwrap();
    WView::from_any(&a).unwrap()
}

#[test]
fn swap_reverses_list() {
    let w = view("[1, 2, 3]");
    let a = w.child(0).unwrap();
    let b = w.child(2).unwrap();
    w.child(1).unwrap(); // a dissected middle element must survive the swap
    a.swap_content_with(&b).unwrap();
    let back = w.to_any().unwrap();
    assert_eq!(back.to_typed::<Vec<i32>>().unwrap(), vec![3, 2, 1]);
}

#[test]
fn insert_into_map_with_type_check() {
    let w = view("{\"a\": 1, \"b\": 2}");
    let n = w.size().unwrap();
    let pair = view("(\"x\", 5)");
    w.insert_after(None, &pair).unwrap();
    assert_eq!(w.type_string(), "msi");
    assert_eq!(w.size().unwrap(), n + 1);

    let key = Any::from_typed(&String::from("x")).unwrap();
    let hit = w.linear_search(key.value(), 0).unwrap().expect("inserted key not found");
    let hit_any = hit.to_any().unwrap();
    let (k, v) = hit_any.to_typed::<(String, i32)>().unwrap();
    assert_eq!(k, "x");
    assert_eq!(v, 5);

    // a pair with the wrong key type is refused
    let bad = view("(1.5, 5)");
    let err = w.insert_after(None, &bad).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    assert_eq!(w.size().unwrap(), n + 1);
}

#[test]
fn child_isolation_after_parent_set() {
    let w = view("[10, 20, 30]");
    let child = w.child(1).unwrap();
    let replacement = Any::from_text("[7]", TextMode::Normal).unwrap();
    w.set(replacement.type_str().as_str(), replacement.value()).unwrap();

    // mutating the detached child leaves the parent's bytes alone
    child.set("i", &99i32.to_be_bytes()).unwrap();
    assert_eq!(w.to_any().unwrap().to_typed::<Vec<i32>>().unwrap(), vec![7]);
    // and the child observes its own mutation
    assert_eq!(child.value(), 99i32.to_be_bytes());
}

#[test]
fn flatten_equals_serialized_form() {
    for text in [
        "[1, 2, 3]",
        "{\"k\": (1, \"v\")}",
        "<a>[true, false]",
        "(1, \"two\", 3.5)",
        "<xli>[9]",
        "error(\"t\", \"i\", \"m\", <i>1)",
    ] {
        let a = Any::from_text(text, TextMode::Normal).unwrap();
        let w = WView::from_any(&a).unwrap();
        // dissect everything there is to dissect
        let n = w.size().unwrap();
        for i in 0..n {
            if w.typechar() == Some(b'm') {
                break;
            }
            let _ = w.child(i);
        }
        assert_eq!(w.type_bytes(), a.type_str().as_bytes(), "{}", text);
        assert_eq!(w.value(), a.value(), "{}", text);
    }
}

#[test]
fn nested_edit_fixes_every_any_header() {
    // an any inside an any: both Vlen framings must track the edit
    let w = view("<a><a>[1]");
    let outer = w.child(0).unwrap();
    assert_eq!(outer.type_string(), "a");
    let inner = outer.child(0).unwrap();
    assert_eq!(inner.type_string(), "li");

    let longer = Any::from_text("[4, 5, 6, 7]", TextMode::Normal).unwrap();
    inner.set("li", longer.value()).unwrap();

    let back = w.to_any().unwrap();
    let (tc, vc) = anywire::scan(b"a", back.value(), true).unwrap();
    assert_eq!((tc, vc), (1, back.value().len()));
    let unwrapped = back.element(0).unwrap().to_any().unwrap();
    let deeper = unwrapped.element(0).unwrap();
    assert_eq!(deeper.value(), longer.value());
}

#[test]
fn erase_and_reinsert_map_entries() {
    let w = view("{\"a\": 1, \"b\": 2, \"c\": 3}");
    let key_b = Any::from_typed(&String::from("b")).unwrap();
    assert!(w.linear_search(key_b.value(), 0).unwrap().is_some());
    // find b's index by probing entries through the any view
    let a = w.to_any().unwrap();
    let mut idx = None;
    for i in 0..a.size().unwrap() {
        let (k, _) = a.entry(i).unwrap();
        if &k.value()[4..] == b"b" {
            idx = Some(i);
        }
    }
    w.erase(idx.unwrap()).unwrap();
    assert_eq!(w.size().unwrap(), 2);
    assert!(w.linear_search(key_b.value(), 0).unwrap().is_none());
    let (tc, vc) = anywire::scan(b"msi", &w.value(), true).unwrap();
    assert_eq!((tc, vc), (3, w.value().len()));
}

#[test]
fn linear_search_over_tuple_list() {
    let w = view("[(1, \"one\"), (2, \"two\"), (3, \"three\")]");
    let hit = w.linear_search(&2i32.to_be_bytes(), 1).unwrap().expect("key 2 not found");
    let (_, name) = hit.to_any().unwrap().to_typed::<(i32, String)>().unwrap();
    assert_eq!(name, "two");
    assert!(w.linear_search(&9i32.to_be_bytes(), 1).unwrap().is_none());
}

#[test]
fn typed_sizes() {
    assert_eq!(view("[1, 2]").size().unwrap(), 2);
    assert_eq!(view("{\"a\": 1}").size().unwrap(), 1);
    assert_eq!(view("(1, 2, 3)").size().unwrap(), 3);
    assert_eq!(view("<oi>5").size().unwrap(), 1);
    assert_eq!(view("<oi>").size().unwrap(), 0);
    assert_eq!(view("<a>1").size().unwrap(), 1);
    assert_eq!(view("<X>").size().unwrap(), 1);
    assert_eq!(view("error(\"a\", \"b\", \"c\")").size().unwrap(), 3);
    assert_eq!(view("42").size().unwrap(), 0);
}
