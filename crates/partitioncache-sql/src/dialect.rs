use sqlparser::dialect::GenericDialect;

/// The SQL dialect fragments are parsed with. `GenericDialect` accepts the
/// broad subset of ANSI SQL shared by the relational source databases the
/// executor runs fragments against; the processor never transpiles between
/// dialects (§6).
pub fn dialect() -> GenericDialect {
    GenericDialect {}
}
