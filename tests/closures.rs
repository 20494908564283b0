use lox::interpret;

#[test]
fn counter_factory() {
    let source = r#"
fun makeCounter() {
    var count = 0;
    fun counter() {
        count = count + 1;
        return count;
    }
    return counter;
}
var a = makeCounter();
print a();
print a();
var b = makeCounter();
print b();"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "1\n2\n1\n";
    assert_eq!(&out, expected);
}

#[test]
fn closures_share_captured_variable() {
    let source = r#"
var get;
var set;
fun make() {
    var value = "start";
    fun g() { return value; }
    fun s(v) { value = v; }
    get = g;
    set = s;
}
make();
print get();
set("changed");
print get();"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "\"start\"\n\"changed\"\n";
    assert_eq!(&out, expected);
}

#[test]
fn closures_in_loop_capture_each_iteration() {
    let source = r#"
var fns0; var fns1; var fns2;
for (var i = 0; i < 3; i = i + 1) {
    var captured = i * 10;
    fun f() { return captured; }
    if (i == 0) fns0 = f;
    if (i == 1) fns1 = f;
    if (i == 2) fns2 = f;
}
print fns0();
print fns1();
print fns2();"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "0\n10\n20\n";
    assert_eq!(&out, expected);
}

#[test]
fn deeply_nested_upvalues() {
    let source = r#"
fun outer() {
    var x = "x";
    fun middle() {
        fun inner() {
            return x + "!";
        }
        return inner;
    }
    return middle;
}
print outer()()();"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(&out, "\"x!\"\n");
}
