//! Component F: the recursive-descent parser. Consumes the token stream from
//! [`lexer`] and drives the `Environment` facade as it goes — every name is
//! resolved (or allocated) at parse time, so by the time a script finishes
//! parsing its whole execution tree is already bound to concrete storage.

mod lexer;

use std::path::{Path, PathBuf};
use std::rc::Rc;

use lexer::{tokenize, Lexeme, Token};

use crate::ast::{
    ArgQuery, ArrayMode, BinaryOpKind, CallArg, Node, NodeRef, NumberFormat, PrintItem,
    PrintModifier, PrintWidth, SleepMode, UnaryOpKind,
};
use crate::environment::{Environment, WorkdirGuard};
use crate::error::{CompileError, MempeekResult};
use crate::location::SourceLocation;
use crate::storage::{ArrayManager, Var};
use crate::subroutine::SubroutineKind;

/// Parses a complete source file into a single `Block` node, resolving every
/// name against `env` along the way.
pub fn parse(env: &Environment, source: &str, file: Rc<PathBuf>) -> MempeekResult<NodeRef> {
    let tokens = tokenize(source);
    let mut parser = Parser {
        env,
        tokens,
        pos: 0,
        file,
    };
    let loc = parser.loc();
    let mut stmts = Vec::new();
    while !parser.at_eof() {
        stmts.push(parser.parse_stmt()?);
    }
    Ok(Node::block(loc, stmts))
}

struct Parser<'a> {
    env: &'a Environment,
    tokens: Vec<Lexeme>,
    pos: usize,
    file: Rc<PathBuf>,
}

fn syntax_err(location: SourceLocation) -> crate::error::MempeekError {
    CompileError::SyntaxError { location }.into()
}

impl<'a> Parser<'a> {
    fn peek_token(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn loc(&self) -> SourceLocation {
        SourceLocation::single_line(self.file.clone(), self.tokens[self.pos].line)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_token(), Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn at_symbol(&self, sym: &str) -> bool {
        matches!(self.peek_token(), Token::Symbol(s) if *s == sym)
    }

    fn at_ident(&self, word: &str) -> bool {
        matches!(self.peek_token(), Token::Ident(s) if s == word)
    }

    fn expect_symbol(&mut self, sym: &str) -> MempeekResult<()> {
        if self.at_symbol(sym) {
            self.advance();
            Ok(())
        } else {
            Err(syntax_err(self.loc()))
        }
    }

    fn expect_ident(&mut self, word: &str) -> MempeekResult<()> {
        if self.at_ident(word) {
            self.advance();
            Ok(())
        } else {
            Err(syntax_err(self.loc()))
        }
    }

    fn expect_ident_text(&mut self) -> MempeekResult<String> {
        match self.peek_token().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(syntax_err(self.loc())),
        }
    }

    /// Parses a subexpression that must be a compile-time constant (used for
    /// `map`/`peek`/`poke` widths and sizes, `def` initializers/range/size).
    fn parse_const_u64(&mut self) -> MempeekResult<u64> {
        let loc = self.loc();
        let node = self.parse_expr()?;
        if !node.is_constant {
            return Err(CompileError::NonconstExpression { location: loc }.into());
        }
        node.const_exec(self.env)
    }

    // ---- statements ------------------------------------------------------

    fn parse_stmt(&mut self) -> MempeekResult<NodeRef> {
        if let Token::Ident(kw) = self.peek_token().clone() {
            match kw.as_str() {
                "def" => return self.parse_def_stmt(),
                "dim" => return self.parse_dim_stmt(),
                "static" => return self.parse_static_stmt(),
                "global" => return self.parse_global_stmt(),
                "map" => return self.parse_map_stmt(),
                "import" => return self.parse_import_stmt(),
                "if" => return self.parse_if_stmt(),
                "while" => return self.parse_while_stmt(),
                "for" => return self.parse_for_stmt(),
                "print" => return self.parse_print_stmt(),
                "break" => {
                    let loc = self.loc();
                    self.advance();
                    self.expect_symbol(";")?;
                    return Ok(Node::brk(loc));
                }
                "exit" => {
                    let loc = self.loc();
                    self.advance();
                    self.expect_symbol(";")?;
                    return Ok(Node::exit(loc));
                }
                "quit" => {
                    let loc = self.loc();
                    self.advance();
                    self.expect_symbol(";")?;
                    return Ok(Node::quit(loc));
                }
                "defproc" | "deffunc" | "defarray" => {
                    return self.parse_subroutine_def(&kw);
                }
                _ if self.is_assignment_start() => {
                    return self.parse_assignment_stmt();
                }
                _ => {}
            }
        }
        let node = self.parse_expr()?;
        self.expect_symbol(";")?;
        Ok(node)
    }

    fn parse_block(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.expect_ident("do")?;
        let mut stmts = Vec::new();
        while !self.at_ident("od") {
            if self.at_eof() {
                return Err(syntax_err(self.loc()));
            }
            stmts.push(self.parse_stmt()?);
        }
        self.advance();
        Ok(Node::block(loc, stmts))
    }

    /// Looks ahead past `Ident ('[' ... ']')?` for a following `:=`, without
    /// consuming anything — distinguishes an assignment statement from a
    /// bare call/expression statement that happens to start with an ident.
    fn is_assignment_start(&self) -> bool {
        let mut j = self.pos + 1;
        if matches!(self.tokens.get(j).map(|l| &l.token), Some(Token::Symbol("["))) {
            let mut depth = 1i32;
            j += 1;
            while j < self.tokens.len() && depth > 0 {
                match &self.tokens[j].token {
                    Token::Symbol("[") => depth += 1,
                    Token::Symbol("]") => depth -= 1,
                    Token::Eof => break,
                    _ => {}
                }
                j += 1;
            }
        }
        matches!(self.tokens.get(j).map(|l| &l.token), Some(Token::Symbol(":=")))
    }

    fn parse_assignment_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        let name = self.expect_ident_text()?;
        if self.at_symbol("[") {
            self.advance();
            if self.at_symbol("]") {
                self.advance();
                self.expect_symbol(":=")?;
                return self.parse_array_rhs(loc, &name);
            }
            let index = self.parse_expr()?;
            self.expect_symbol("]")?;
            self.expect_symbol(":=")?;
            let array = self.resolve_array(&loc, &name)?;
            let expr = self.parse_expr()?;
            self.expect_symbol(";")?;
            return Ok(Node::assign_index(loc, array, index, expr));
        }
        self.expect_symbol(":=")?;
        let var = match self.env.get_var(&name) {
            Some(v) => v,
            None => self.env.alloc_var(&loc, &name)?,
        };
        let expr = self.parse_expr()?;
        self.expect_symbol(";")?;
        Ok(Node::assign_var(loc, var, expr))
    }

    fn parse_array_rhs(&mut self, loc: SourceLocation, name: &str) -> MempeekResult<NodeRef> {
        if self.at_symbol("{") {
            self.advance();
            let mut elems = Vec::new();
            if !self.at_symbol("}") {
                loop {
                    elems.push(self.parse_expr()?);
                    if self.at_symbol(",") {
                        self.advance();
                        continue;
                    }
                    break;
                }
            }
            self.expect_symbol("}")?;
            self.expect_symbol(";")?;
            let array = self.resolve_array(&loc, name)?;
            return Ok(Node::assign_list(loc, array, elems));
        }
        if let Token::StringLit(s) = self.peek_token().clone() {
            self.advance();
            self.expect_symbol(";")?;
            let array = self.resolve_array(&loc, name)?;
            return Ok(Node::string_literal(loc, array, s));
        }
        if self.at_ident("arg") {
            self.advance();
            self.expect_symbol("[")?;
            let idx = self.parse_expr()?;
            self.expect_symbol("]")?;
            self.expect_symbol(";")?;
            let array = self.resolve_array(&loc, name)?;
            return Ok(Node::assign_arg(loc, array, idx));
        }
        if let Token::Ident(src_name) = self.peek_token().clone() {
            self.advance();
            self.expect_symbol("[")?;
            self.expect_symbol("]")?;
            self.expect_symbol(";")?;
            let dest = self.resolve_array(&loc, name)?;
            let src = self.resolve_array(&loc, &src_name)?;
            return Ok(Node::assign_copy(loc, dest, src));
        }
        Err(syntax_err(loc))
    }

    fn resolve_array(&self, loc: &SourceLocation, name: &str) -> MempeekResult<crate::storage::ArrayHandle> {
        self.env
            .get_array(name)
            .ok_or_else(|| CompileError::UndefinedVar {
                location: loc.clone(),
                name: name.to_string(),
            }
            .into())
    }

    fn parse_def_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        let name = self.expect_ident_text()?;

        if self.at_ident("from") {
            self.advance();
            let src_name = self.expect_ident_text()?;
            self.expect_symbol(";")?;
            let src = self.env.get_var(&src_name).ok_or_else(|| CompileError::UndefinedVar {
                location: loc.clone(),
                name: src_name.clone(),
            })?;
            if !src.is_def() {
                return Err(syntax_err(loc));
            }
            let var = self.env.alloc_def(&loc, &name)?;
            var.set(src.get());
            var.set_range(src.get_range());
            if let Some(sz) = src.get_size() {
                var.set_size(sz);
            }
            for member in self.env.get_struct_members(&src_name) {
                let src_member = self
                    .env
                    .get_var(&format!("{src_name}.{member}"))
                    .expect("struct member name came from the registry itself");
                let new_member = self.env.alloc_def(&loc, &format!("{name}.{member}"))?;
                new_member.set(src_member.get().wrapping_sub(src.get()));
                new_member.set_range(src_member.get_range());
                if let Some(sz) = src_member.get_size() {
                    new_member.set_size(sz);
                }
            }
            return Ok(Node::def(loc));
        }

        let var = self.env.alloc_def(&loc, &name)?;
        if self.at_symbol(":=") {
            self.advance();
            let value_loc = self.loc();
            let expr = self.parse_expr()?;
            if !expr.is_constant {
                return Err(CompileError::NonconstExpression { location: value_loc }.into());
            }
            var.set(expr.const_exec(self.env)?);
        }
        if self.at_ident("range") {
            self.advance();
            var.set_range(self.parse_const_u64()?);
        }
        if self.at_ident("size") {
            self.advance();
            var.set_size(self.parse_const_u64()? as usize);
        }
        self.expect_symbol(";")?;
        Ok(Node::def(loc))
    }

    fn parse_dim_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        let name = self.expect_ident_text()?;
        self.expect_symbol("[")?;
        let size = self.parse_expr()?;
        self.expect_symbol("]")?;
        self.expect_symbol(";")?;
        let array = self.env.alloc_array(&loc, &name)?;
        Ok(Node::dim(loc, array, size))
    }

    fn parse_static_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        let name = self.expect_ident_text()?;

        if self.at_symbol("[") {
            self.advance();
            if self.at_symbol("]") {
                self.advance();
                if self.at_symbol(":=") {
                    self.advance();
                    let src_name = self.expect_ident_text()?;
                    self.expect_symbol("[")?;
                    self.expect_symbol("]")?;
                    self.expect_symbol(";")?;
                    let src = self.resolve_array(&loc, &src_name)?;
                    let array = self.env.alloc_static_array(&loc, &name)?;
                    return Ok(Node::static_copy_array(loc, array, src));
                }
                self.expect_symbol(";")?;
                let array = self.env.alloc_static_array(&loc, &name)?;
                return Ok(Node::static_uninit_array(loc, array));
            }
            let size = self.parse_expr()?;
            self.expect_symbol("]")?;
            self.expect_symbol(";")?;
            let array = self.env.alloc_static_array(&loc, &name)?;
            return Ok(Node::static_sized_array(loc, array, size));
        }

        self.expect_symbol(":=")?;
        let var = self.env.alloc_static_var(&loc, &name)?;
        let expr = self.parse_expr()?;
        self.expect_symbol(";")?;
        Ok(Node::static_scalar(loc, var, expr))
    }

    fn parse_global_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        let name = self.expect_ident_text()?;
        self.expect_symbol(";")?;
        self.env.alloc_global_var(&loc, &name)?;
        Ok(Node::def(loc))
    }

    fn parse_map_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        self.expect_symbol("(")?;
        let mut nums = Vec::new();
        let mut device: Option<String> = None;
        loop {
            if let Token::StringLit(s) = self.peek_token().clone() {
                self.advance();
                device = Some(s);
            } else {
                nums.push(self.parse_const_u64()?);
            }
            if self.at_symbol(",") {
                self.advance();
                continue;
            }
            break;
        }
        self.expect_symbol(")")?;
        self.expect_symbol(";")?;
        let (phys, at, size) = match nums.len() {
            2 => (nums[0], nums[0], nums[1]),
            3 => (nums[0], nums[1], nums[2]),
            _ => return Err(syntax_err(loc)),
        };
        self.env
            .map_memory(&loc, phys, at, size, device.as_deref().map(Path::new))?;
        Ok(Node::map(loc))
    }

    fn parse_import_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        let Token::StringLit(file) = self.peek_token().clone() else {
            return Err(syntax_err(loc));
        };
        self.advance();
        let run_once = if self.at_ident("once") {
            self.advance();
            true
        } else {
            false
        };
        self.expect_symbol(";")?;

        let Some(path) = self.env.resolve_import(&file, run_once)? else {
            return Ok(Node::import(loc, None));
        };
        let content = std::fs::read_to_string(&path).map_err(|_| CompileError::FileNotFound {
            location: loc.clone(),
            file: file.clone(),
        })?;
        let child_file = Rc::new(path.clone());
        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let guard = WorkdirGuard::enter(&dir).map_err(|_| CompileError::FileNotFound {
            location: loc.clone(),
            file: file.clone(),
        })?;
        let result = parse(self.env, &content, child_file);
        drop(guard);
        match result {
            Ok(child) => Ok(Node::import(loc, Some(child))),
            Err(e) => {
                self.env.rewind_import(&file);
                Err(e)
            }
        }
    }

    fn parse_if_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        let cond = self.parse_expr()?;
        let then_branch = self.parse_block()?;
        let else_branch = if self.at_ident("else") {
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(Node::if_node(loc, cond, then_branch, else_branch))
    }

    fn parse_while_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Node::while_node(loc, cond, body))
    }

    fn parse_for_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        let name = self.expect_ident_text()?;
        self.expect_symbol(":=")?;
        let init = self.parse_expr()?;
        self.expect_ident("to")?;
        let to = self.parse_expr()?;
        let step = if self.at_ident("step") {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        let var = match self.env.get_var(&name) {
            Some(v) => v,
            None => self.env.alloc_var(&loc, &name)?,
        };
        let body = self.parse_block()?;
        Ok(Node::for_node(loc, var, init, to, step, body))
    }

    fn parse_print_stmt(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        let mut items = vec![self.parse_print_item()?];
        while self.at_symbol(",") {
            self.advance();
            items.push(self.parse_print_item()?);
        }
        self.expect_symbol(";")?;
        Ok(Node::print(loc, items))
    }

    fn parse_print_item(&mut self) -> MempeekResult<PrintItem> {
        if let Token::StringLit(s) = self.peek_token().clone() {
            self.advance();
            return Ok(PrintItem::Literal(s));
        }
        let node = self.parse_expr()?;
        let modifier = self.parse_print_modifier();
        Ok(PrintItem::Expr { node, modifier })
    }

    /// `@hex`, `@sdec32`, `@str`, etc. — format name plus an optional
    /// trailing bit width, applied to the preceding print expression.
    fn parse_print_modifier(&mut self) -> PrintModifier {
        let mut modifier = PrintModifier::default();
        if !self.at_symbol("@") {
            return modifier;
        }
        self.advance();
        let Token::Ident(word) = self.peek_token().clone() else {
            return modifier;
        };
        self.advance();
        let split = word.find(|c: char| c.is_ascii_digit());
        let (name, digits) = match split {
            Some(i) => (&word[..i], word[i..].parse::<u32>().ok()),
            None => (word.as_str(), None),
        };
        modifier.format = match name {
            "hex" => NumberFormat::Hex,
            "dec" => NumberFormat::Dec,
            "sdec" => NumberFormat::SignedDec,
            "bin" => NumberFormat::Bin,
            "float" => NumberFormat::Float,
            "str" => {
                modifier.array_mode = ArrayMode::StringDecode;
                NumberFormat::Dec
            }
            _ => NumberFormat::Dec,
        };
        if let Some(bits) = digits {
            modifier.width = match bits {
                8 => PrintWidth::Eight,
                16 => PrintWidth::Sixteen,
                32 => PrintWidth::ThirtyTwo,
                64 => PrintWidth::SixtyFour,
                _ => PrintWidth::WordSize,
            };
        }
        modifier
    }

    fn parse_subroutine_def(&mut self, kw: &str) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.advance();
        let kind = match kw {
            "defproc" => SubroutineKind::Procedure,
            "deffunc" => SubroutineKind::Function,
            _ => SubroutineKind::ArrayFunction,
        };
        let name = self.expect_ident_text()?;
        self.env.enter_subroutine_context(loc.clone(), name, kind)?;

        let result = self.parse_subroutine_body();
        match result {
            Ok(node) => {
                self.env.commit_subroutine_context();
                Ok(node)
            }
            Err(e) => {
                self.env.abort_subroutine_context();
                Err(e)
            }
        }
    }

    fn parse_subroutine_body(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        self.expect_symbol("(")?;
        if !self.at_symbol(")") {
            loop {
                let param_loc = self.loc();
                let is_array = if self.at_symbol("&") {
                    self.advance();
                    true
                } else {
                    false
                };
                if self.at_symbol("...") {
                    self.advance();
                    self.env.set_subroutine_varargs();
                    break;
                }
                let pname = self.expect_ident_text()?;
                self.env.set_subroutine_param(param_loc, &pname, is_array)?;
                if self.at_symbol(",") {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect_symbol(")")?;
        let body = self.parse_block()?;
        self.env.set_subroutine_body(body);
        Ok(Node::def(loc))
    }

    // ---- expressions -------------------------------------------------------

    fn parse_expr(&mut self) -> MempeekResult<NodeRef> {
        self.parse_bin_expr(0)
    }

    fn parse_bin_expr(&mut self, min_prec: u8) -> MempeekResult<NodeRef> {
        let mut lhs = self.parse_unary()?;
        loop {
            let sym = match self.peek_token() {
                Token::Symbol(s) => *s,
                _ => break,
            };
            let Some((op, prec)) = binop_info(sym) else { break };
            if prec < min_prec {
                break;
            }
            let loc = self.loc();
            self.advance();
            let rhs = self.parse_bin_expr(prec + 1)?;
            lhs = Node::binary_op(loc, op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> MempeekResult<NodeRef> {
        if let Token::Symbol(sym) = self.peek_token() {
            let op = match *sym {
                "-" => Some(UnaryOpKind::Neg),
                "~" => Some(UnaryOpKind::BitNot),
                "!" => Some(UnaryOpKind::LogicalNot),
                _ => None,
            };
            if let Some(op) = op {
                let loc = self.loc();
                self.advance();
                let child = self.parse_unary()?;
                return Ok(Node::unary_op(loc, op, child));
            }
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> MempeekResult<NodeRef> {
        let mut node = self.parse_primary()?;
        while self.at_symbol(":") {
            let loc = self.loc();
            self.advance();
            let width = self.parse_const_u64()? as u32;
            node = Node::restriction(loc, node, width);
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> MempeekResult<NodeRef> {
        let loc = self.loc();
        match self.peek_token().clone() {
            Token::IntLit(text) => {
                self.advance();
                Node::parse_int_literal(loc.clone(), &text).ok_or_else(|| syntax_err(loc))
            }
            Token::FloatLit(text) => {
                self.advance();
                Node::parse_float_literal(loc.clone(), &text).ok_or_else(|| syntax_err(loc))
            }
            Token::StringLit(s) => {
                self.advance();
                let array = ArrayManager::fresh_handle();
                Ok(Node::string_literal(loc, array, s))
            }
            Token::Symbol("(") => {
                self.advance();
                let e = self.parse_expr()?;
                self.expect_symbol(")")?;
                Ok(e)
            }
            Token::Ident(name) => self.parse_ident_primary(loc, name),
            _ => Err(syntax_err(loc)),
        }
    }

    fn parse_ident_primary(&mut self, loc: SourceLocation, name: String) -> MempeekResult<NodeRef> {
        match name.as_str() {
            "peek" => {
                self.advance();
                self.parse_peek(loc)
            }
            "poke" => {
                self.advance();
                self.parse_poke(loc)
            }
            "sleep" => {
                self.advance();
                self.parse_sleep(loc)
            }
            "arg" => {
                self.advance();
                self.parse_arg(loc, ArgQuery::Value)
            }
            "argsize" => {
                self.advance();
                self.parse_arg(loc, ArgQuery::ArraySize)
            }
            "argtype" => {
                self.advance();
                self.parse_arg(loc, ArgQuery::Type)
            }
            "sdiv" => {
                self.advance();
                self.parse_signed_binop(loc, BinaryOpKind::SDiv)
            }
            "smod" => {
                self.advance();
                self.parse_signed_binop(loc, BinaryOpKind::SMod)
            }
            "slt" => {
                self.advance();
                self.parse_signed_binop(loc, BinaryOpKind::SLt)
            }
            "sgt" => {
                self.advance();
                self.parse_signed_binop(loc, BinaryOpKind::SGt)
            }
            "sle" => {
                self.advance();
                self.parse_signed_binop(loc, BinaryOpKind::SLe)
            }
            "sge" => {
                self.advance();
                self.parse_signed_binop(loc, BinaryOpKind::SGe)
            }
            _ => self.parse_name_primary(loc, &name),
        }
    }

    fn parse_signed_binop(&mut self, loc: SourceLocation, op: BinaryOpKind) -> MempeekResult<NodeRef> {
        self.expect_symbol("(")?;
        let a = self.parse_expr()?;
        self.expect_symbol(",")?;
        let b = self.parse_expr()?;
        self.expect_symbol(")")?;
        Ok(Node::binary_op(loc, op, a, b))
    }

    fn parse_peek(&mut self, loc: SourceLocation) -> MempeekResult<NodeRef> {
        self.expect_symbol("(")?;
        let addr = self.parse_expr()?;
        let width = if self.at_symbol(",") {
            self.advance();
            self.parse_const_u64()? as u32
        } else {
            self.env.word_size()
        };
        self.expect_symbol(")")?;
        Ok(Node::peek(loc, addr, width))
    }

    /// `poke(addr, value)`, `poke(addr, value, mask)`, or
    /// `poke(addr, value, mask, width)` — width always trails an explicit mask.
    fn parse_poke(&mut self, loc: SourceLocation) -> MempeekResult<NodeRef> {
        self.expect_symbol("(")?;
        let addr = self.parse_expr()?;
        self.expect_symbol(",")?;
        let value = self.parse_expr()?;
        let mut mask = None;
        let mut width = self.env.word_size();
        if self.at_symbol(",") {
            self.advance();
            let third = self.parse_expr()?;
            if self.at_symbol(",") {
                self.advance();
                width = self.parse_const_u64()? as u32;
                mask = Some(third);
            } else {
                mask = Some(third);
            }
        }
        self.expect_symbol(")")?;
        Ok(Node::poke(loc, addr, value, mask, width))
    }

    fn parse_sleep(&mut self, loc: SourceLocation) -> MempeekResult<NodeRef> {
        if self.at_ident("until") {
            self.advance();
            self.expect_symbol("(")?;
            let target = self.parse_expr()?;
            self.expect_symbol(")")?;
            return Ok(Node::sleep(loc, SleepMode::Absolute(target)));
        }
        self.expect_symbol("(")?;
        if self.at_symbol(")") {
            self.advance();
            return Ok(Node::sleep(loc, SleepMode::Now));
        }
        let ms = self.parse_expr()?;
        self.expect_symbol(")")?;
        Ok(Node::sleep(loc, SleepMode::Relative(ms)))
    }

    fn parse_arg(&mut self, loc: SourceLocation, query: ArgQuery) -> MempeekResult<NodeRef> {
        if !self.at_symbol("(") {
            return Ok(Node::arg(loc, query, None, None));
        }
        self.advance();
        if self.at_symbol(")") {
            self.advance();
            return Ok(Node::arg(loc, query, None, None));
        }
        let index = self.parse_expr()?;
        let arr_index = if self.at_symbol(",") {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect_symbol(")")?;
        Ok(Node::arg(loc, query, Some(index), arr_index))
    }

    fn parse_name_primary(&mut self, loc: SourceLocation, name: &str) -> MempeekResult<NodeRef> {
        self.advance();

        if let Some(base) = name.strip_suffix(".range") {
            let var = self.env.get_var(base).ok_or_else(|| CompileError::UndefinedVar {
                location: loc.clone(),
                name: base.to_string(),
            })?;
            if !var.is_def() {
                return Err(syntax_err(loc));
            }
            if self.at_symbol("[") {
                self.advance();
                let index = self.parse_expr()?;
                self.expect_symbol("]")?;
                return Ok(Node::range(loc, var, Some(index)));
            }
            return Ok(Node::range(loc, var, None));
        }

        if let Some(array) = self.env.get_array(name) {
            if self.at_symbol("[") {
                self.advance();
                if self.at_symbol("]") {
                    self.advance();
                    return Ok(Node::array_access(loc, array, None));
                }
                let index = self.parse_expr()?;
                self.expect_symbol("]")?;
                return Ok(Node::array_access(loc, array, Some(index)));
            }
            return Ok(Node::array_access(loc, array, None));
        }

        if let Some(var) = self.env.get_var(name) {
            return Ok(Node::var(loc, var));
        }

        if self.at_symbol("(") {
            self.advance();
            let mut args = Vec::new();
            if !self.at_symbol(")") {
                loop {
                    args.push(self.parse_call_arg()?);
                    if self.at_symbol(",") {
                        self.advance();
                        continue;
                    }
                    break;
                }
            }
            self.expect_symbol(")")?;
            if self.env.is_builtin(name) {
                if let Some(node) = self.env.resolve_builtin_call(&loc, name, args)? {
                    return Ok(node);
                }
                return Err(syntax_err(loc));
            }
            if let Some(node) = self.env.resolve_subroutine_call(&loc, name, args)? {
                return Ok(node);
            }
            return Err(CompileError::UndefinedVar {
                location: loc,
                name: name.to_string(),
            }
            .into());
        }

        Err(CompileError::UndefinedVar {
            location: loc,
            name: name.to_string(),
        }
        .into())
    }

    fn parse_call_arg(&mut self) -> MempeekResult<CallArg> {
        let node = self.parse_expr()?;
        if node.produces_array() {
            Ok(CallArg::Array(node))
        } else {
            Ok(CallArg::Scalar(node))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;

    fn run(src: &str) -> Environment {
        let env = Environment::new(Vec::new());
        let file = Rc::new(PathBuf::from("<test>"));
        let tree = parse(&env, src, file).expect("parse");
        tree.execute(&env).expect("execute");
        env
    }

    #[test]
    fn arithmetic_precedence() {
        let env = run("x := 2 + 3 * 4;");
        assert_eq!(env.get_var("x").unwrap().get(), 14);
    }

    #[test]
    fn parenthesized_expression_overrides_precedence() {
        let env = run("x := (2 + 3) * 4;");
        assert_eq!(env.get_var("x").unwrap().get(), 20);
    }

    #[test]
    fn if_else_picks_the_taken_branch() {
        let env = run("x := 0; if 1 do x := 5; od else do x := 9; od");
        assert_eq!(env.get_var("x").unwrap().get(), 5);
        let env = run("x := 0; if 0 do x := 5; od else do x := 9; od");
        assert_eq!(env.get_var("x").unwrap().get(), 9);
    }

    #[test]
    fn while_loop_counts_up() {
        let env = run("i := 0; while i < 3 do i := i + 1; od");
        assert_eq!(env.get_var("i").unwrap().get(), 3);
    }

    #[test]
    fn for_loop_is_inclusive_of_the_endpoint() {
        let env = run("s := 0; for i := 0 to 3 do s := s + i; od");
        assert_eq!(env.get_var("s").unwrap().get(), 6);
    }

    #[test]
    fn array_dim_and_index_assignment() {
        let env = run("dim arr[4]; arr[0] := 10; arr[1] := arr[0] + 5;");
        let arr = env.get_array("arr").unwrap();
        assert_eq!(arr.get(0), Some(10));
        assert_eq!(arr.get(1), Some(15));
    }

    #[test]
    fn def_from_rebases_struct_members() {
        let env = run("def A := 0x1000; def A.x := 4; def B from A;");
        assert_eq!(env.get_var("B").unwrap().get(), 0x1000);
        assert_eq!(env.get_var("B.x").unwrap().get(), 0x1004);
    }

    #[test]
    fn deffunc_return_value_is_visible_to_the_caller() {
        let env = run("deffunc double(x) do return := x * 2; od y := double(21);");
        assert_eq!(env.get_var("y").unwrap().get(), 42);
    }

    #[test]
    fn signed_binop_pseudo_keywords_parse_and_evaluate() {
        let env = run("x := sdiv(0 - 10, 3);");
        // -10 / 3 truncated toward zero is -3, i.e. 0xfffffffffffffffd as u64.
        assert_eq!(env.get_var("x").unwrap().get(), (-3i64) as u64);
    }

    #[test]
    fn restriction_truncates_to_the_requested_width() {
        let env = run("x := (0xFFFF):8;");
        assert_eq!(env.get_var("x").unwrap().get(), 0xFF);
    }

    #[test]
    fn break_exits_the_enclosing_loop_only() {
        let env = run("i := 0; while 1 do i := i + 1; if i >= 3 do break; od od");
        assert_eq!(env.get_var("i").unwrap().get(), 3);
    }

    #[test]
    fn unary_negation_and_bitwise_not() {
        let env = run("x := -5; y := ~0;");
        assert_eq!(env.get_var("x").unwrap().get(), (-5i64) as u64);
        assert_eq!(env.get_var("y").unwrap().get(), u64::MAX);
    }

    #[test]
    fn static_scalar_keeps_its_value_across_a_second_parse_of_the_same_statement() {
        let env = Environment::new(Vec::new());
        let file = Rc::new(PathBuf::from("<test>"));
        let tree = parse(&env, "static count := 1;", file).unwrap();
        tree.execute(&env).unwrap();
        assert_eq!(env.get_var("count").unwrap().get(), 1);
        env.get_var("count").unwrap().set(41);

        let file2 = Rc::new(PathBuf::from("<test2>"));
        let tree2 = parse(&env, "count := count + 1;", file2).unwrap();
        tree2.execute(&env).unwrap();
        assert_eq!(env.get_var("count").unwrap().get(), 42);
    }

    #[test]
    fn strlen_builtin_reads_a_string_literal_array() {
        let env = run("dim s[1]; s[] := \"hi\"; n := strlen(s);");
        assert_eq!(env.get_var("n").unwrap().get(), 2);
    }

    #[test]
    fn scalar_builtins_abs_min_max() {
        let env = run("a := abs(0 - 7); b := min(3, 9); c := max(3, 9);");
        assert_eq!(env.get_var("a").unwrap().get(), 7);
        assert_eq!(env.get_var("b").unwrap().get(), 3);
        assert_eq!(env.get_var("c").unwrap().get(), 9);
    }

    #[test]
    fn strcat_builtin_writes_its_first_argument_by_reference() {
        let env = run("dim s[1]; s[] := \"abc\"; dim t[1]; strcat(t, s, s);");
        let t = env.get_array("t").unwrap();
        let words: Vec<u64> = (0..t.size()).map(|i| t.get(i).unwrap_or(0)).collect();
        assert_eq!(crate::ast::strenc_decode(&words), "abcabc");
    }

    #[test]
    fn undefined_name_called_as_a_function_is_a_compile_error() {
        let env = Environment::new(Vec::new());
        let file = Rc::new(PathBuf::from("<test>"));
        let err = parse(&env, "x := nope(1);", file).unwrap_err();
        assert!(matches!(
            err,
            crate::error::MempeekError::Compile(CompileError::UndefinedVar { .. })
        ));
    }
}

fn binop_info(sym: &str) -> Option<(BinaryOpKind, u8)> {
    use BinaryOpKind::*;
    Some(match sym {
        "||" => (LOr, 1),
        "^^" => (LXor, 2),
        "&&" => (LAnd, 3),
        "|" => (Or, 4),
        "^" => (Xor, 5),
        "&" => (And, 6),
        "==" => (Eq, 7),
        "!=" => (Ne, 7),
        "<" => (Lt, 8),
        ">" => (Gt, 8),
        "<=" => (Le, 8),
        ">=" => (Ge, 8),
        "<<" => (Shl, 9),
        ">>" => (Shr, 9),
        "+" => (Add, 10),
        "-" => (Sub, 10),
        "*" => (Mul, 11),
        "/" => (Div, 11),
        "%" => (Mod, 11),
        _ => return None,
    })
}
