use lox::interpret;

#[test]
fn fields_and_methods() {
    let source = r#"
class Point {
    init(x, y) {
        this.x = x;
        this.y = y;
    }
    sum() {
        return this.x + this.y;
    }
}
var p = Point(1, 2);
print p.sum();
p.x = 10;
print p.sum();
print p;
print Point;"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "3\n12\n<instance of Point>\n<class Point>\n";
    assert_eq!(&out, expected);
}

#[test]
fn inheritance_and_super() {
    let source = r#"
class A {
    method() { print "A method"; }
    name() { return "A"; }
}
class B < A {
    method() { print "B method"; }
    test() { super.method(); }
}
class C < B {}
C().test();
C().method();
print C().name();"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "\"A method\"\n\"B method\"\n\"A\"\n";
    assert_eq!(&out, expected);
}

#[test]
fn bound_methods_keep_receiver() {
    let source = r#"
class Greeter {
    init(name) { this.name = name; }
    greet() { return "hi " + this.name; }
}
var greet = Greeter("bob").greet;
print greet;
print greet();"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "<fn greet>\n\"hi bob\"\n";
    assert_eq!(&out, expected);
}

#[test]
fn initializer_returns_receiver() {
    let source = r#"
class Foo {
    init() {
        this.count = 1;
        return;
    }
}
var foo = Foo();
print foo.init() == foo;
print foo.count;"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(&out, "true\n1\n");
}
